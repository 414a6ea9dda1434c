// docs.rs
use crate::{device, handlers, models};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "Sea Lamp companion", description = "Lamp discovery, control and setup"),
    paths(
        handlers::get_status,
        handlers::retry,
        handlers::begin_setup,
        handlers::use_address,
        handlers::disconnect,
        handlers::power,
        handlers::brightness,
        handlers::color,
        handlers::apply_preset,
        handlers::list_presets,
        handlers::live,
        handlers::scan_networks,
        handlers::submit_wifi,
    ),
    components(
        schemas(
            models::StatusView,
            models::ConnectionState,
            models::LampSnapshot,
            models::DragPhase,
            models::AddressRequest,
            models::PowerRequest,
            models::BrightnessRequest,
            models::ColorRequest,
            models::PresetRequest,
            models::WifiRequest,
            device::Preset,
            device::LiveFrame,
            device::WifiNetwork,
        )
    )
)]
pub struct ApiDoc;
