//! Device enumeration with retries, and in-process simulated devices.

use std::time::Duration;

use tracing::{debug, info};

use camlink_core::remote::DEFAULT_FRAME_INTERVAL;
use camlink_core::{
    Context, DeviceAnnouncement, DeviceRef, DeviceServer, Participant, ProductLine, Result,
    StreamKind, StreamProfile,
};

/// Query `ctx` up to `tries` times, pausing `delay` while the result is empty.
pub async fn query_with_retries(
    ctx: &Context,
    mask: ProductLine,
    tries: u32,
    delay: Duration,
) -> Vec<DeviceRef> {
    let tries = tries.max(1);
    for attempt in 1..=tries {
        let list = ctx.query_devices(mask);
        if !list.is_empty() {
            return list;
        }
        debug!("attempt {attempt}/{tries}: no devices");
        if attempt < tries {
            tokio::time::sleep(delay).await;
        }
    }
    Vec::new()
}

/// Announcement of the `index`th simulated device.
pub fn simulated_announcement(prefix: &str, index: u32) -> DeviceAnnouncement {
    DeviceAnnouncement {
        name: format!("simulated camera {index}"),
        serial: format!("SIM{index:06}"),
        product_line: ProductLine::STEREO,
        topic_root: format!("{prefix}/{index}"),
        streams: StreamKind::ALL.iter().map(|k| StreamProfile::for_kind(*k)).collect(),
    }
}

/// Host `count` simulated devices on `participant`.
pub fn start_simulated(participant: &Participant, prefix: &str, count: u32) -> Result<Vec<DeviceServer>> {
    let servers = (0..count)
        .map(|i| DeviceServer::start(participant, simulated_announcement(prefix, i), DEFAULT_FRAME_INTERVAL))
        .collect::<Result<Vec<_>>>()?;
    if count > 0 {
        info!("hosting {count} simulated device(s) on domain {}", participant.domain_id());
    }
    Ok(servers)
}

/// One output line for `dev`.
pub fn describe(dev: &DeviceRef, verbose: bool) -> String {
    if !verbose {
        return dev.address().to_string();
    }
    match dev.remote() {
        Some(handle) => {
            let a = &handle.announcement;
            let streams: Vec<&str> = a.streams.iter().map(|s| s.stream.as_str()).collect();
            format!(
                "{}  name=\"{}\" serial={} streams=[{}]",
                dev.address(),
                a.name,
                a.serial,
                streams.join(",")
            )
        }
        None => format!("{}  product-line={:#x}", dev.address(), dev.product_line().bits()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::DeviceInfo;

    #[test]
    fn announcement_lists_all_streams() {
        let a = simulated_announcement("sim", 3);
        assert_eq!(a.topic_root, "sim/3");
        assert_eq!(a.serial, "SIM000003");
        assert_eq!(a.streams.len(), StreamKind::ALL.len());
    }

    #[test]
    fn describe_plain_and_verbose() {
        let dev = DeviceInfo::software("sw/x");
        assert_eq!(describe(&dev, false), "sw/x");
        assert_eq!(describe(&dev, true), "sw/x  product-line=0x100");
    }

    #[tokio::test]
    async fn simulated_devices_are_listed() {
        let device = Participant::new(150, "sim").unwrap();
        let mut servers = start_simulated(&device, "list", 2).unwrap();
        let ctx = Context::new(serde_json::json!({ "bus": { "domain": 150 } })).unwrap();

        let mask = ProductLine::ANY_NATIVE | ProductLine::SW_ONLY;
        let list = query_with_retries(&ctx, mask, 20, Duration::from_millis(10)).await;
        assert!(!list.is_empty());
        assert!(list.iter().all(|d| d.address().starts_with("bus.150/list/")));

        for server in &mut servers {
            server.stop().await;
        }
    }

    #[tokio::test]
    async fn empty_result_after_all_tries() {
        let ctx = Context::new(serde_json::json!({ "bus": false })).unwrap();
        let list = query_with_retries(&ctx, ProductLine::ANY, 2, Duration::from_millis(1)).await;
        assert!(list.is_empty());
    }
}
