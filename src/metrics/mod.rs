// metrics/mod.rs
use crate::discovery::LampCommand;
use ::metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn setup_metrics(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to setup metrics: {}", e))
}

pub fn state_entered(state: &'static str) {
    counter!("sealamp_state_entered_total", "state" => state).increment(1);
}

pub fn probe_finished(found: bool) {
    let outcome = if found { "found" } else { "missed" };
    counter!("sealamp_probe_total", "outcome" => outcome).increment(1);
}

pub fn sync_finished(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("sealamp_sync_total", "outcome" => outcome).increment(1);
}

pub(crate) fn command_issued(command: &LampCommand) {
    let kind = match command {
        LampCommand::SetPower(_) | LampCommand::TogglePower => "power",
        LampCommand::Brightness(..) => "brightness",
        LampCommand::Color(..) => "color",
        LampCommand::ApplyPreset(_) => "preset",
    };
    counter!("sealamp_command_total", "kind" => kind).increment(1);
}

pub fn shell_served(strategy: &'static str, source: &'static str) {
    counter!("sealamp_shell_requests_total", "strategy" => strategy, "source" => source)
        .increment(1);
}
