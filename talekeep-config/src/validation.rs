use crate::models::Config;

/// Non-fatal configuration findings surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

/// Clamp out-of-range values in place and report what was adjusted.
///
/// Hard errors are reserved for values the process cannot run with; anything
/// that has a sane floor or ceiling is clamped and warned about instead.
pub fn validate(cfg: &mut Config) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if cfg.queue.workers == 0 {
        warnings.push(ConfigWarning {
            field: "queue.workers",
            message: "must be at least 1, clamping".into(),
        });
        cfg.queue.workers = 1;
    }

    if cfg.queue.pending_capacity == 0 {
        warnings.push(ConfigWarning {
            field: "queue.pending_capacity",
            message: "must be at least 1, clamping".into(),
        });
        cfg.queue.pending_capacity = 1;
    }

    if cfg.scheduler.check_interval_minutes == 0 {
        warnings.push(ConfigWarning {
            field: "scheduler.check_interval_minutes",
            message: "floor is 1 minute, clamping".into(),
        });
        cfg.scheduler.check_interval_minutes = 1;
    }

    for (field, hour) in [
        ("scheduler.window_start", &mut cfg.scheduler.window_start),
        ("scheduler.window_end", &mut cfg.scheduler.window_end),
    ] {
        if *hour > 23 {
            warnings.push(ConfigWarning {
                field,
                message: format!("hour {hour} out of range 0-23, clamping to 23"),
            });
            *hour = 23;
        }
    }

    if cfg.event_hub.client_buffer == 0 {
        warnings.push(ConfigWarning {
            field: "event_hub.client_buffer",
            message: "must be at least 1, clamping".into(),
        });
        cfg.event_hub.client_buffer = 1;
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_zero_workers() {
        let mut cfg = Config::default();
        cfg.queue.workers = 0;
        let warnings = validate(&mut cfg);
        assert_eq!(cfg.queue.workers, 1);
        assert!(warnings.iter().any(|w| w.field == "queue.workers"));
    }

    #[test]
    fn clamps_window_hours() {
        let mut cfg = Config::default();
        cfg.scheduler.window_start = 30;
        validate(&mut cfg);
        assert_eq!(cfg.scheduler.window_start, 23);
    }

    #[test]
    fn valid_config_has_no_warnings() {
        let mut cfg = Config::default();
        assert!(validate(&mut cfg).is_empty());
    }
}
