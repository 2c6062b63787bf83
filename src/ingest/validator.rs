use chrono::NaiveDateTime;

use crate::models::DeviceReport;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Result of validating one `DeviceReport`: critical failures in
/// `errors` reject the record; `warnings` never do.
#[derive(Debug, Default, Clone)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Structural and semantic validation; never mutates its input.
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validates one report. Critical rules: required fields present,
    /// latitude/longitude in range, timestamp parses, imei is exactly
    /// 15 digits, status non-empty. Everything else is a warning.
    pub fn validate(&self, report: &DeviceReport) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        if report.device_id.trim().is_empty() {
            outcome.errors.push("Missing deviceId".to_string());
        }
        if report.imei.len() != 15 || !report.imei.chars().all(|c| c.is_ascii_digit()) {
            outcome
                .errors
                .push(format!("Invalid imei: '{}'", report.imei));
        }

        match report.latitude {
            Some(lat) if (-90.0..=90.0).contains(&lat) => {}
            Some(lat) => outcome.errors.push(format!("Invalid latitude: {lat}")),
            None => outcome.errors.push("Missing latitude".to_string()),
        }
        match report.longitude {
            Some(lon) if (-180.0..=180.0).contains(&lon) => {}
            Some(lon) => outcome.errors.push(format!("Invalid longitude: {lon}")),
            None => outcome.errors.push("Missing longitude".to_string()),
        }

        if NaiveDateTime::parse_from_str(&report.timestamp, TIMESTAMP_FORMAT).is_err() {
            outcome
                .errors
                .push(format!("Invalid timestamp: '{}'", report.timestamp));
        }

        if report.status.trim().is_empty() {
            outcome.errors.push("Missing status".to_string());
        }

        if let Some(speed) = report.speed {
            if !(0.0..=300.0).contains(&speed) {
                outcome.warnings.push(format!("Speed out of range: {speed}"));
            }
        }
        if let Some(gsm) = report.gsm_strength {
            if !(0..=31).contains(&gsm) {
                outcome
                    .warnings
                    .push(format!("gsmStrength out of range: {gsm}"));
            }
        }
        if let Some(raw) = &report.ignition {
            let upper = raw.trim().to_ascii_uppercase();
            let recognized = [
                "1",
                "ON",
                "TRUE",
                "IGON",
                "IG_ON",
                "IGNITION_ON",
                "ENGINE_ON",
                "STARTED",
                "0",
                "OFF",
                "FALSE",
                "IGOFF",
                "IG_OFF",
                "IGNITION_OFF",
                "ENGINE_OFF",
                "STOPPED",
            ];
            if !recognized.contains(&upper.as_str()) {
                outcome
                    .warnings
                    .push(format!("Unrecognized ignition value: '{raw}', normalizing to OFF"));
            }
        }
        if report.is_suspicious_origin() {
            outcome
                .warnings
                .push("Coordinates within 1e-6 of (0,0), flagged suspicious".to_string());
        }

        outcome
    }

    /// Validates each report in a batch independently, preserving index
    /// alignment with the input.
    pub fn validate_batch(&self, reports: &[DeviceReport]) -> Vec<ValidationOutcome> {
        reports.iter().map(|r| self.validate(r)).collect()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_report() -> DeviceReport {
        DeviceReport::from_csv("D1,12.97,77.59,40,90,2025-06-15 14:30:00")
            .map(|mut r| {
                r.imei = "123456789012345".to_string();
                r.status = "A".to_string();
                r
            })
            .unwrap()
    }

    #[test]
    fn valid_report_has_no_errors() {
        let outcome = Validator::new().validate(&valid_report());
        assert!(outcome.is_valid(), "{:?}", outcome.errors);
    }

    #[test]
    fn latitude_boundaries_are_accepted() {
        let mut r = valid_report();
        r.latitude = Some(90.0);
        assert!(Validator::new().validate(&r).is_valid());
        r.latitude = Some(-90.0);
        assert!(Validator::new().validate(&r).is_valid());
    }

    #[test]
    fn latitude_just_outside_boundary_rejected() {
        let mut r = valid_report();
        r.latitude = Some(90.0001);
        assert!(!Validator::new().validate(&r).is_valid());
    }

    #[test]
    fn imei_wrong_length_rejected() {
        let mut r = valid_report();
        r.imei = "1234567890123".to_string();
        assert!(!Validator::new().validate(&r).is_valid());
        r.imei = "12345678901234567".to_string();
        assert!(!Validator::new().validate(&r).is_valid());
    }

    #[test]
    fn alternate_timestamp_format_rejected() {
        let mut r = valid_report();
        r.timestamp = "2025-06-15T14:30:00".to_string();
        assert!(!Validator::new().validate(&r).is_valid());
    }

    #[test]
    fn speed_out_of_range_is_warning_only() {
        let mut r = valid_report();
        r.speed = Some(301.0);
        let outcome = Validator::new().validate(&r);
        assert!(outcome.is_valid());
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn batch_preserves_index_alignment() {
        let mut bad = valid_report();
        bad.latitude = Some(200.0);
        let reports = vec![valid_report(), bad, valid_report()];
        let outcomes = Validator::new().validate_batch(&reports);
        assert!(outcomes[0].is_valid());
        assert!(!outcomes[1].is_valid());
        assert!(outcomes[1]
            .errors
            .iter()
            .any(|e| e.contains("Invalid latitude")));
        assert!(outcomes[2].is_valid());
    }
}
