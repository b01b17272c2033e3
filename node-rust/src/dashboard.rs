//! TTY status dashboard.
//!
//! A single live-updating status line fed from the frame stream. It is a
//! sink like any other: never a consumer of business logic, registered only
//! when stdout is a terminal (or forced via config), and free to drop
//! frames under pressure.

use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use vehicle_types::{Field, FieldValue, TelemetryFrame};

use crate::config::NodeConfig;
use crate::fanout::FrameSink;

#[derive(Default)]
struct DashState {
    soc: Option<f64>,
    inside_temp: Option<f64>,
    outside_temp: Option<f64>,
    speed: Option<f64>,
    gear: Option<String>,
    charge: Option<String>,
    locked: Option<bool>,
}

pub struct DashboardSink {
    bar: ProgressBar,
    state: Mutex<DashState>,
}

pub fn enabled(cfg: &NodeConfig) -> bool {
    cfg.dashboard.unwrap_or_else(|| std::io::stdout().is_terminal())
}

impl DashboardSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(250));
        Self { bar, state: Mutex::new(DashState::default()) }
    }

    fn render(state: &DashState) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(soc) = state.soc {
            parts.push(format!("⚡ {soc:.0}%"));
        }
        if let Some(c) = &state.charge {
            parts.push(c.clone());
        }
        if let Some(speed) = state.speed {
            parts.push(format!("{speed:.0} mph"));
        }
        if let Some(gear) = &state.gear {
            parts.push(format!("gear {gear}"));
        }
        if let Some(t) = state.inside_temp {
            parts.push(format!("in {t:.1}°C"));
        }
        if let Some(t) = state.outside_temp {
            parts.push(format!("out {t:.1}°C"));
        }
        if let Some(locked) = state.locked {
            parts.push(if locked { "🔒".into() } else { "🔓".into() });
        }
        if parts.is_empty() {
            "waiting for telemetry…".into()
        } else {
            parts.join(" │ ")
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for DashboardSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for DashboardSink {
    fn name(&self) -> &'static str {
        "dashboard"
    }

    async fn deliver(&self, frame: TelemetryFrame) {
        let message = {
            let mut state = self.state.lock().expect("dashboard state lock");
            for (field, value) in &frame.fields {
                match field {
                    Field::Soc | Field::BatteryLevel => state.soc = value.as_f64(),
                    Field::InsideTemp => state.inside_temp = value.as_f64(),
                    Field::OutsideTemp => state.outside_temp = value.as_f64(),
                    Field::VehicleSpeed => state.speed = value.as_f64(),
                    Field::Gear => state.gear = value.as_text().map(str::to_string),
                    Field::ChargeState => state.charge = value.as_text().map(str::to_string),
                    Field::Locked => state.locked = value.as_bool(),
                    _ => {}
                }
            }
            Self::render(&state)
        };
        self.bar.set_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_handles_empty_and_partial_state() {
        let empty = DashState::default();
        assert_eq!(DashboardSink::render(&empty), "waiting for telemetry…");

        let partial = DashState {
            soc: Some(72.0),
            speed: Some(30.4),
            locked: Some(true),
            ..Default::default()
        };
        let line = DashboardSink::render(&partial);
        assert!(line.contains("72%"));
        assert!(line.contains("30 mph"));
        assert!(line.contains('🔒'));
    }

    #[tokio::test]
    async fn deliver_updates_state_from_frames() {
        let sink = DashboardSink::new();
        sink.deliver(TelemetryFrame {
            vin: "5YJ3E1EA1NF000000".into(),
            captured_at: 0,
            fields: [(Field::Soc, FieldValue::Float(55.0))].into_iter().collect(),
        })
        .await;
        assert_eq!(sink.state.lock().unwrap().soc, Some(55.0));
        sink.finish();
    }
}
