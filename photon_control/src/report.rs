//! Protocol messages and status reports.
//!
//! Wire format: `ok` on success, `error:<n>` with the numeric status
//! kind, `ALARM:<n>` for alarms, `[MSG:…]` for feedback, `[HLP:…]` for
//! help, a version banner at start-up, and `<State,MPos:x,y,z>` status
//! reports with absolute machine positions in millimetres.

use photon_common::N_AXIS;
use photon_common::settings::Settings;
use photon_common::state::SystemSignals;
use photon_common::status::{Alarm, Status};

/// Start-up banner with the program version.
pub fn banner() -> String {
    format!("Photon {} ['$' for help]", env!("CARGO_PKG_VERSION"))
}

/// Help message listing the command surface.
pub fn help() -> &'static str {
    "[HLP:$$ $H $T $SLP $C ! ~ ? X G-code]"
}

/// One reply to a command or G-code line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Error(Status),
    Alarm(Alarm),
    /// Feedback message, followed by `ok`.
    Msg(String),
    /// Pre-rendered multi-line output (banner after reset).
    Raw(String),
}

impl Reply {
    /// Render to the wire, without the trailing newline.
    pub fn render(&self) -> String {
        match self {
            Reply::Ok => "ok".to_string(),
            Reply::Error(status) => format!("error:{}", status.code()),
            Reply::Alarm(alarm) => format!("ALARM:{}", alarm.code()),
            Reply::Msg(text) => format!("[MSG:{text}]\r\nok"),
            Reply::Raw(text) => text.clone(),
        }
    }
}

/// `<State,MPos:x,y,z>` with millimetre coordinates.
pub fn status_report(signals: &SystemSignals, settings: &Settings) -> String {
    let position = signals.position();
    let mut mpos = [0.0f32; N_AXIS];
    for idx in 0..N_AXIS {
        mpos[idx] = position[idx] as f32 / settings.axes[idx].steps_per_mm;
    }
    format!(
        "<{},MPos:{:.3},{:.3},{:.3}>",
        signals.state().label(),
        mpos[0],
        mpos[1],
        mpos[2]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_common::state::state_machine;
    use std::sync::atomic::Ordering;

    #[test]
    fn replies_render_wire_format() {
        assert_eq!(Reply::Ok.render(), "ok");
        assert_eq!(Reply::Error(Status::ModalGroupViolation).render(), "error:12");
        assert_eq!(Reply::Alarm(Alarm::HardLimit).render(), "ALARM:1");
        assert_eq!(Reply::Msg("Pgm End".into()).render(), "[MSG:Pgm End]\r\nok");
    }

    #[test]
    fn status_report_formats_position() {
        let (_aggregator, port) = state_machine();
        let settings = Settings::default();
        let signals = port.signals();
        signals.sys_position[0].store(10667, Ordering::Relaxed);
        let report = status_report(signals, &settings);
        assert!(report.starts_with("<Init,MPos:"));
        assert!(report.contains("100.00"), "{report}");
        assert!(report.ends_with(",0.000,0.000>"));
    }

    #[test]
    fn banner_carries_version() {
        assert!(banner().contains(env!("CARGO_PKG_VERSION")));
    }
}
