//! Simulated drivers for exercising a lab without hardware.
//!
//! | operation | params                                 | effect                                   |
//! |-----------|----------------------------------------|------------------------------------------|
//! | `wait`    | `duration_ms`                          | sleeps                                   |
//! | `acquire` | `points`, `interval_ms`, `amplitude`   | streams a sine trace, creates a sample   |
//! | `fail`    | `message`                              | ends with a device fault                 |

use async_trait::async_trait;
use labflow_core::action_server::{invalid_params, ActionHandler, ActionServer};
use labflow_core::active::{Active, StreamHeader, StreamSpec};
use labflow_core::model::{Action, ActionError, ErrorCode, SampleIo, SampleStatus, SampleType};
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const DRIVER: &str = "sim";

const DATA_KEY: &str = "data";
const MAX_POINTS: u64 = 100_000;

pub struct Wait;

#[async_trait]
impl ActionHandler for Wait {
    async fn run(&self, active: &mut Active) -> Result<(), ActionError> {
        let ms = active.action().param_u64("duration_ms", 100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        active.set_process_param("waited_ms", ms);
        Ok(())
    }
}

pub struct Acquire;

#[async_trait]
impl ActionHandler for Acquire {
    fn streams(&self, _action: &Action) -> Vec<StreamSpec> {
        vec![StreamSpec::new(DATA_KEY).with_header(StreamHeader::with_columns(["t_s", "value"]))]
    }

    async fn prepare(&self, active: &mut Active) -> Result<(), ActionError> {
        let points = active.action().param_u64("points", 10);
        if points > MAX_POINTS {
            return Err(invalid_params(format!(
                "points must be at most {MAX_POINTS}, got {points}"
            )));
        }
        Ok(())
    }

    async fn run(&self, active: &mut Active) -> Result<(), ActionError> {
        let points = active.action().param_u64("points", 10);
        let interval_ms = active.action().param_u64("interval_ms", 10);
        let amplitude = active.action().param_f64("amplitude", 1.0);

        let mut header = Map::new();
        header.insert("points".into(), json!(points));
        header.insert("interval_ms".into(), json!(interval_ms));
        active.update_header(DATA_KEY, header);
        active.close_header(DATA_KEY);

        for i in 0..points {
            let t = i as f64 * interval_ms as f64 / 1000.0;
            let Value::Object(row) = json!({ "t_s": t, "value": amplitude * (t * 10.0).sin() })
            else {
                continue;
            };
            active.enqueue_data(DATA_KEY, row);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }

        let sample = active.new_sample(SampleType::Liquid).await;
        active
            .append_sample(vec![sample], SampleIo::Out, Some(SampleStatus::Created), None)
            .map_err(|e| ActionError::new(ErrorCode::Critical, e.to_string()))?;
        active.set_process_param("points", points);
        Ok(())
    }
}

pub struct Fail;

#[async_trait]
impl ActionHandler for Fail {
    async fn run(&self, active: &mut Active) -> Result<(), ActionError> {
        let message = active
            .action()
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("simulated fault")
            .to_string();
        Err(ActionError::new(ErrorCode::DeviceFault, message))
    }
}

/// Register every simulated operation on `server`.
pub fn register(server: &mut ActionServer) {
    server.register("wait", Wait);
    server.register("acquire", Acquire);
    server.register("fail", Fail);
}
