//! Probe runner: clock sync, a streaming interval, clock sync again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use camlink_core::time::format_nanos;
use camlink_core::{
    BusDeviceFactory, CamlinkError, DeviceAnnouncement, DeviceFactory, DeviceRef, DeviceServer,
    DevicesChangedCallback, OffsetClock, OffsetStats, Participant, ProductLine, RemoteDevice,
    Result, StreamKind, StreamProfile, StreamStats, SystemClock, run_clock_sync,
};

const DISCOVERY_POLL: Duration = Duration::from_millis(20);

/// Everything a probe run needs.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub domain: u32,
    pub participant_name: String,
    pub discovery_timeout: Duration,
    pub sync_iterations: u64,
    pub sync_timeout: Duration,
    pub run_time: Duration,
    pub streams: Vec<StreamKind>,
    /// Host a simulated device in-process.
    pub simulate: bool,
    /// `host - device` offset of the simulated device clock.
    pub simulated_offset: i64,
    pub frame_interval: Duration,
    pub topic_root: String,
}

/// Outcome of [`run_probe`].
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub address: String,
    pub before: OffsetStats,
    pub after: OffsetStats,
    pub streams: Vec<StreamStats>,
}

impl ProbeReport {
    pub fn drift(&self) -> OffsetStats {
        self.before.drift(&self.after)
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "device {}", self.address)?;
        writeln!(f, "offset before: {}", self.before)?;
        for stats in &self.streams {
            writeln!(f, "{stats}")?;
        }
        writeln!(f, "offset after:  {}", self.after)?;
        let drift = self.drift();
        write!(
            f,
            "drift:         avg {} / min {} / max {}",
            format_nanos(drift.average),
            format_nanos(drift.min),
            format_nanos(drift.max)
        )
    }
}

fn simulated_announcement(topic_root: &str) -> DeviceAnnouncement {
    DeviceAnnouncement {
        name: "probe target".into(),
        serial: "PROBE0001".into(),
        product_line: ProductLine::STEREO,
        topic_root: topic_root.into(),
        streams: StreamKind::ALL.iter().map(|k| StreamProfile::for_kind(*k)).collect(),
    }
}

/// Start the in-process device when `opts.simulate` is set.
fn start_target(opts: &ProbeOptions) -> Result<Option<DeviceServer>> {
    if !opts.simulate {
        return Ok(None);
    }
    let clock = Arc::new(OffsetClock::new(Arc::new(SystemClock), -opts.simulated_offset));
    let participant = Participant::with_clock(opts.domain, "camlink-probe-target", clock)?;
    let server = DeviceServer::start(
        &participant,
        simulated_announcement(&opts.topic_root),
        opts.frame_interval,
    )?;
    info!(
        "simulated device on {} (clock offset {})",
        opts.topic_root,
        format_nanos(opts.simulated_offset)
    );
    Ok(Some(server))
}

async fn discover(factory: &BusDeviceFactory, timeout: Duration) -> Result<DeviceRef> {
    let mask = ProductLine::ANY | ProductLine::SW_ONLY;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(dev) = factory.query_devices(mask).into_iter().next() {
            return Ok(dev);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CamlinkError::Timeout(timeout));
        }
        tokio::time::sleep(DISCOVERY_POLL).await;
    }
}

async fn connect(opts: &ProbeOptions) -> Result<(BusDeviceFactory, RemoteDevice)> {
    let host = Participant::new(opts.domain, opts.participant_name.clone())?;
    let callback: DevicesChangedCallback = Arc::new(|removed: &[DeviceRef], added: &[DeviceRef]| {
        for dev in removed {
            warn!("device {} disconnected", dev.address());
        }
        for dev in added {
            info!("device {} connected", dev.address());
        }
    });
    let factory = BusDeviceFactory::new(host, callback)?;
    let dev = discover(&factory, opts.discovery_timeout).await?;
    let session = RemoteDevice::connect(&dev)?;
    Ok((factory, session))
}

async fn stop_target(server: Option<DeviceServer>) {
    if let Some(mut server) = server {
        server.stop().await;
    }
}

/// Sync, stream for `run_time`, sync again.
pub async fn run_probe(opts: &ProbeOptions) -> Result<ProbeReport> {
    let target = start_target(opts)?;
    let result = probe(opts).await;
    stop_target(target).await;
    result
}

async fn probe(opts: &ProbeOptions) -> Result<ProbeReport> {
    let (_factory, session) = connect(opts).await?;
    let result = probe_session(opts, &session).await;
    session.disconnect().await;
    result
}

async fn probe_session(opts: &ProbeOptions, session: &RemoteDevice) -> Result<ProbeReport> {
    let before = run_clock_sync(session, opts.sync_iterations, opts.sync_timeout).await?;

    let announced = &session.announcement().streams;
    let profiles: Vec<StreamProfile> = opts
        .streams
        .iter()
        .filter_map(|kind| announced.iter().find(|p| p.kind == *kind).cloned())
        .collect();

    let mut streams = Vec::new();
    if profiles.is_empty() {
        warn!("{}: none of the requested streams is available", session.address());
    } else {
        let names: Vec<String> = profiles.iter().map(|p| p.stream.clone()).collect();
        let consumers = names
            .iter()
            .map(|name| session.subscribe(name, before.average))
            .collect::<Result<Vec<_>>>()?;
        session.open(profiles).await?;
        info!("{}: streaming {} for {:?}", session.address(), names.join(","), opts.run_time);

        tokio::time::sleep(opts.run_time).await;

        session.close(names).await?;
        for consumer in consumers {
            streams.push(consumer.finish().await);
        }
    }

    let after = run_clock_sync(session, opts.sync_iterations, opts.sync_timeout).await?;
    Ok(ProbeReport {
        address: session.address().to_string(),
        before,
        after,
        streams,
    })
}

/// Ask the first discovered device to shut down.
pub async fn send_exit(opts: &ProbeOptions) -> Result<()> {
    let target = start_target(opts)?;
    let result = exit_device(opts).await;
    if let Some(server) = &target {
        if result.is_ok() && tokio::time::timeout(opts.discovery_timeout, server.exited()).await.is_err() {
            warn!("simulated device did not exit");
        }
    }
    stop_target(target).await;
    result
}

async fn exit_device(opts: &ProbeOptions) -> Result<()> {
    let (_factory, session) = connect(opts).await?;
    let result = session.exit().await;
    session.disconnect().await;
    if result.is_ok() {
        info!("{}: exit acknowledged", session.address());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(domain: u32) -> ProbeOptions {
        ProbeOptions {
            domain,
            participant_name: "probe-test".into(),
            discovery_timeout: Duration::from_secs(2),
            sync_iterations: 3,
            sync_timeout: Duration::from_secs(2),
            run_time: Duration::from_millis(120),
            streams: vec![StreamKind::Depth, StreamKind::Gyro],
            simulate: true,
            simulated_offset: 0,
            frame_interval: Duration::from_millis(2),
            topic_root: "probe/test".into(),
        }
    }

    #[tokio::test]
    async fn probe_reports_each_stream() {
        let report = run_probe(&options(151)).await.unwrap();
        assert_eq!(report.address, "bus.151/probe/test");
        assert_eq!(report.before.samples, 2);
        assert_eq!(report.after.samples, 2);

        let names: Vec<&str> = report.streams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["depth", "gyro"]);
        assert!(report.streams.iter().all(|s| s.count > 0));
        assert!(report.to_string().contains("drift:"));
    }

    #[tokio::test]
    async fn skipped_sync_yields_zero_offsets() {
        let mut opts = options(152);
        opts.sync_iterations = 0;
        opts.streams.clear();
        let report = run_probe(&opts).await.unwrap();
        assert!(report.streams.is_empty());
        assert_eq!(report.before, OffsetStats::default());
        assert_eq!(report.drift().average, 0);
    }

    #[tokio::test]
    async fn exit_stops_simulated_device() {
        send_exit(&options(153)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_device_times_out() {
        let mut opts = options(154);
        opts.simulate = false;
        opts.discovery_timeout = Duration::from_millis(50);
        let err = run_probe(&opts).await.unwrap_err();
        assert!(matches!(err, CamlinkError::Timeout(_)));
    }
}
