// provision.rs
//! Handing home WiFi credentials to a lamp that is running its setup access point.

use crate::device::{DeviceApi, StatePatch, WifiNetwork};
use crate::discovery::with_deadline;
use crate::error::AppError;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

const SCAN_ATTEMPTS: u32 = 8;
const SCAN_POLL: Duration = Duration::from_millis(1500);
const REBOOT_DELAY: Duration = Duration::from_millis(500);

/// Starts a scan on the lamp and polls until it reports networks.
///
/// Strongest signal first, one entry per SSID. An empty list means the lamp
/// never finished scanning.
pub async fn scan_networks(
    device: &dyn DeviceApi,
    ap_host: &str,
    request_timeout: Duration,
) -> Result<Vec<WifiNetwork>, AppError> {
    for attempt in 1..=SCAN_ATTEMPTS {
        let networks = with_deadline(request_timeout, device.networks(ap_host))
            .await
            .map_err(|_| AppError::Unreachable {
                host: ap_host.to_string(),
            })?;
        if !networks.is_empty() {
            info!(attempt, count = networks.len(), "WiFi scan finished");
            return Ok(rank(networks));
        }
        if attempt < SCAN_ATTEMPTS {
            tokio::time::sleep(SCAN_POLL).await;
        }
    }
    warn!(host = %ap_host, "WiFi scan returned nothing");
    Ok(Vec::new())
}

fn rank(mut networks: Vec<WifiNetwork>) -> Vec<WifiNetwork> {
    networks.retain(|n| !n.ssid.trim().is_empty());
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    let mut seen = HashSet::new();
    networks.retain(|n| seen.insert(n.ssid.clone()));
    networks
}

/// Saves the credentials and reboots the lamp onto the home network.
pub async fn submit_wifi(
    device: &dyn DeviceApi,
    ap_host: &str,
    ssid: &str,
    psk: &str,
    request_timeout: Duration,
) -> Result<(), AppError> {
    let ssid = ssid.trim();
    if ssid.is_empty() {
        return Err(AppError::Validation("network name is empty".into()));
    }

    with_deadline(request_timeout, device.save_wifi(ap_host, ssid, psk))
        .await
        .map_err(|e| {
            warn!(host = %ap_host, error = %e, "Saving WiFi settings failed");
            AppError::InvalidState("could not save WiFi settings".into())
        })?;
    info!(host = %ap_host, %ssid, "WiFi settings saved, rebooting lamp");

    tokio::time::sleep(REBOOT_DELAY).await;
    // the lamp often drops the connection mid-reply while restarting
    if let Err(e) = with_deadline(request_timeout, device.update(ap_host, &StatePatch::reboot())).await
    {
        info!(error = %e, "Reboot request unanswered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Reach};

    const AP: &str = "4.3.2.1";
    const TIMEOUT: Duration = Duration::from_secs(3);

    fn network(ssid: &str, rssi: i32) -> WifiNetwork {
        WifiNetwork {
            ssid: ssid.to_string(),
            rssi,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scan_polls_until_results_arrive() {
        let device = MockDevice::new().with_host(AP, Reach::Online);
        device.push_scan(Vec::new());
        device.push_scan(Vec::new());
        device.push_scan(vec![
            network("Attic", -80),
            network("Home", -52),
            network("", -40),
            network("Home", -70),
        ]);

        let networks = scan_networks(&device, AP, TIMEOUT).await.unwrap();
        assert_eq!(networks, vec![network("Home", -52), network("Attic", -80)]);

        let calls = device.calls_to("networks");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].at - calls[0].at, SCAN_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_gives_up_after_eight_polls() {
        let device = MockDevice::new().with_host(AP, Reach::Online);
        let networks = scan_networks(&device, AP, TIMEOUT).await.unwrap();
        assert!(networks.is_empty());
        assert_eq!(device.calls_to("networks").len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_reports_unreachable_access_point() {
        let device = MockDevice::new();
        let err = scan_networks(&device, AP, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, AppError::Unreachable { ref host } if host == AP));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_saves_then_reboots() {
        let device = MockDevice::new().with_host(AP, Reach::Online);
        submit_wifi(&device, AP, " Home ", "hunter22", TIMEOUT)
            .await
            .unwrap();

        assert_eq!(
            device.saved_wifi(),
            Some(("Home".to_string(), "hunter22".to_string()))
        );
        let save = &device.calls_to("cfg")[0];
        let reboot = &device.calls_to("update")[0];
        assert_eq!(reboot.at - save.at, REBOOT_DELAY);
        assert_eq!(device.patches(), vec![StatePatch::reboot()]);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_ssid_never_reaches_the_lamp() {
        let device = MockDevice::new().with_host(AP, Reach::Online);
        let err = submit_wifi(&device, AP, "  ", "", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(device.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_is_reported() {
        let device = MockDevice::new().with_host(AP, Reach::Timeout);
        let err = submit_wifi(&device, AP, "Home", "", TIMEOUT).await.unwrap_err();
        assert_eq!(err.to_string(), "Not available right now: could not save WiFi settings");
        assert!(device.calls_to("update").is_empty());
    }
}
