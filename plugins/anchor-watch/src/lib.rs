//! Anchor Watch Plugin
//!
//! Demonstration plugin for the Pelorus runtime. Watches the vessel's
//! position while anchored and raises a telemetry alarm when the vessel
//! drifts outside the configured radius.
//!
//! Exports the conventional plugin surface (`id`, `name`, `schema`,
//! `start`, `stop`), receives position updates through `on_delta`, and
//! serves its current state on a declared HTTP endpoint.

use extism_pdk::*;
use serde::{Deserialize, Serialize};

#[host_fn]
extern "ExtismHost" {
    fn subscribe(request: String) -> String;
    fn publish_delta(delta: String) -> String;
    fn log(request: String) -> String;
    fn set_status(request: String) -> String;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Config {
    /// Alarm radius in meters.
    #[serde(default = "default_radius")]
    radius_m: f64,
}

fn default_radius() -> f64 {
    50.0
}

#[derive(Debug, Serialize, Deserialize)]
struct Position {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct PathValue {
    path: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Delta {
    context: String,
    values: Vec<PathValue>,
}

#[derive(Debug, Deserialize)]
struct DeltaEnvelope {
    #[allow(dead_code)]
    subscription_id: String,
    delta: Delta,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct State {
    radius_m: f64,
    anchor: Option<Position>,
    last: Option<Position>,
    alarm: bool,
}

const STATE_VAR: &str = "state";

fn load_state() -> State {
    var::get::<Vec<u8>>(STATE_VAR)
        .ok()
        .flatten()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn store_state(state: &State) -> FnResult<()> {
    var::set(STATE_VAR, serde_json::to_vec(state)?)?;
    Ok(())
}

// ============================================================================
// Plugin surface
// ============================================================================

#[plugin_fn]
pub fn id() -> FnResult<String> {
    Ok("anchor-watch".to_string())
}

#[plugin_fn]
pub fn name() -> FnResult<String> {
    Ok("Anchor Watch".to_string())
}

#[plugin_fn]
pub fn schema() -> FnResult<String> {
    Ok(serde_json::json!({
        "type": "object",
        "properties": {
            "radius_m": {
                "type": "number",
                "title": "Alarm radius (m)",
                "default": default_radius(),
            }
        }
    })
    .to_string())
}

#[plugin_fn]
pub fn start(config_json: String) -> FnResult<()> {
    let config: Config = if config_json.trim().is_empty() {
        serde_json::from_str("{}")?
    } else {
        serde_json::from_str(&config_json)?
    };

    store_state(&State {
        radius_m: config.radius_m,
        ..State::default()
    })?;

    let request = serde_json::json!({ "pattern": "vessels.self.navigation.position" });
    unsafe { subscribe(request.to_string())? };

    unsafe {
        set_status(
            serde_json::json!({ "message": format!("watching, radius {} m", config.radius_m) })
                .to_string(),
        )?
    };
    Ok(())
}

#[plugin_fn]
pub fn stop() -> FnResult<()> {
    // Subscriptions are cleaned up by the host on unload.
    Ok(())
}

#[plugin_fn]
pub fn on_delta(Json(envelope): Json<DeltaEnvelope>) -> FnResult<()> {
    let mut state = load_state();

    for pv in &envelope.delta.values {
        if pv.path != "navigation.position" {
            continue;
        }
        let Ok(position) = serde_json::from_value::<Position>(pv.value.clone()) else {
            continue;
        };

        // First fix after start becomes the anchor position.
        if state.anchor.is_none() {
            unsafe {
                log(serde_json::json!({
                    "level": "info",
                    "message": format!(
                        "anchor set at {:.6},{:.6}",
                        position.latitude, position.longitude
                    ),
                })
                .to_string())?
            };
            state.anchor = Some(Position {
                latitude: position.latitude,
                longitude: position.longitude,
            });
        }

        let drift = state
            .anchor
            .as_ref()
            .map(|anchor| distance_m(anchor, &position))
            .unwrap_or(0.0);
        let alarm = drift > state.radius_m;

        if alarm != state.alarm {
            let delta = serde_json::json!({
                "context": envelope.delta.context,
                "values": [{
                    "path": "notifications.navigation.anchor",
                    "value": {
                        "state": if alarm { "alarm" } else { "normal" },
                        "message": format!("drift {:.1} m", drift),
                    }
                }]
            });
            unsafe { publish_delta(delta.to_string())? };
        }

        state.alarm = alarm;
        state.last = Some(position);
    }

    store_state(&state)?;
    Ok(())
}

#[plugin_fn]
pub fn http_endpoints() -> FnResult<String> {
    Ok(serde_json::json!([
        { "method": "GET", "path": "state", "handler": "handle_http" }
    ])
    .to_string())
}

#[plugin_fn]
pub fn handle_http(_request: String) -> FnResult<String> {
    let state = load_state();
    Ok(serde_json::json!({
        "status": 200,
        "headers": [["content-type", "application/json"]],
        "body": serde_json::to_string(&state)?,
    })
    .to_string())
}

/// Equirectangular distance, plenty for anchor-watch ranges.
fn distance_m(a: &Position, b: &Position) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let x = (b.longitude - a.longitude).to_radians() * ((lat_a + lat_b) / 2.0).cos();
    let y = lat_b - lat_a;
    (x * x + y * y).sqrt() * EARTH_RADIUS_M
}
