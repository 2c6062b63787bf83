use serde::{Deserialize, Deserializer, Serialize};

/// Raw device telemetry report as received from a broker topic.
///
/// Numeric fields are deserialized leniently (quoted or bare) because
/// devices in the field send both `"latitude":"12.97"` and
/// `"latitude":12.97`. Invalid/missing values become `None` rather than
/// a parse error so the Validator (not serde) is the single place that
/// rejects a record — this keeps batch indices aligned with the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    #[serde(rename = "deviceId", default)]
    pub device_id: String,
    #[serde(default)]
    pub imei: String,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub speed: Option<f64>,
    #[serde(
        default,
        alias = "course",
        deserialize_with = "de_opt_f64",
        rename = "heading"
    )]
    pub heading: Option<f64>,
    #[serde(default)]
    pub ignition: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "vehicleStatus", default)]
    pub vehicle_status: Option<String>,
    #[serde(rename = "gsmStrength", default, deserialize_with = "de_opt_i64")]
    pub gsm_strength: Option<i64>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "additionalData", default)]
    pub additional_data: Option<String>,
    #[serde(rename = "timeIntervals", default)]
    pub time_intervals: Option<String>,
    /// Stamped by the MessageReceiver when the payload is pulled off the
    /// wire; not part of the wire format.
    #[serde(skip)]
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Canonical ignition state. Free-form device strings normalize to one
/// of these two; unknown or empty input normalizes to `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ignition {
    On,
    Off,
}

impl Ignition {
    const ON_TOKENS: &'static [&'static str] = &[
        "1",
        "ON",
        "TRUE",
        "IGON",
        "IG_ON",
        "IGNITION_ON",
        "ENGINE_ON",
        "STARTED",
    ];
    const OFF_TOKENS: &'static [&'static str] = &[
        "0",
        "OFF",
        "FALSE",
        "IGOFF",
        "IG_OFF",
        "IGNITION_OFF",
        "ENGINE_OFF",
        "STOPPED",
    ];

    /// Normalizes a free-form ignition string. Idempotent:
    /// `normalize(normalize(x).as_str()) == normalize(x)`.
    pub fn normalize(raw: Option<&str>) -> Self {
        let Some(raw) = raw else { return Ignition::Off };
        let upper = raw.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Ignition::Off;
        }
        if Self::ON_TOKENS.contains(&upper.as_str()) {
            Ignition::On
        } else if Self::OFF_TOKENS.contains(&upper.as_str()) {
            Ignition::Off
        } else {
            Ignition::Off
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ignition::On => "ON",
            Ignition::Off => "OFF",
        }
    }
}

impl std::fmt::Display for Ignition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 8 named alert bits carried in a pure-binary `additionalData` string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFlags {
    pub speed_crossed: bool,
    pub angle_change_over_30: bool,
    pub theft_or_towing: bool,
    pub sharp_turning: bool,
    pub distance_change: bool,
    pub roaming: bool,
    pub harsh_acceleration: bool,
    pub harsh_braking: bool,
}

impl DecodedFlags {
    /// bit0..bit7, least-significant bit first.
    pub fn from_bits(byte: u8) -> Self {
        Self {
            speed_crossed: byte & 0b0000_0001 != 0,
            angle_change_over_30: byte & 0b0000_0010 != 0,
            theft_or_towing: byte & 0b0000_0100 != 0,
            sharp_turning: byte & 0b0000_1000 != 0,
            distance_change: byte & 0b0001_0000 != 0,
            roaming: byte & 0b0010_0000 != 0,
            harsh_acceleration: byte & 0b0100_0000 != 0,
            harsh_braking: byte & 0b1000_0000 != 0,
        }
    }
}

/// `additionalData` is either a decoded bitfield (pure-binary string) or
/// passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdditionalData {
    Flags(DecodedFlags),
    Raw(String),
    None,
}

impl AdditionalData {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            None => AdditionalData::None,
            Some(s) if s.is_empty() => AdditionalData::None,
            Some(s) => {
                if let Some(byte) = parse_pure_binary(s) {
                    AdditionalData::Flags(DecodedFlags::from_bits(byte))
                } else {
                    AdditionalData::Raw(s.to_string())
                }
            }
        }
    }
}

/// A "pure binary string" is all `0`/`1` characters, 1-8 of them.
fn parse_pure_binary(s: &str) -> Option<u8> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.len() > 8 {
        return None;
    }
    if !trimmed.chars().all(|c| c == '0' || c == '1') {
        return None;
    }
    u8::from_str_radix(trimmed, 2).ok()
}

impl DeviceReport {
    /// Parses a CSV-form payload: `deviceId,lat,lon[,speed,heading,ts]`.
    pub fn from_csv(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() < 3 {
            return None;
        }
        let device_id = fields[0].to_string();
        let latitude = fields[1].parse::<f64>().ok();
        let longitude = fields[2].parse::<f64>().ok();
        let speed = fields.get(3).and_then(|s| s.parse::<f64>().ok());
        let heading = fields.get(4).and_then(|s| s.parse::<f64>().ok());
        let timestamp = fields.get(5).map(|s| s.to_string()).unwrap_or_default();

        Some(Self {
            device_id,
            imei: String::new(),
            latitude,
            longitude,
            speed,
            heading,
            ignition: None,
            status: String::new(),
            vehicle_status: None,
            gsm_strength: None,
            timestamp,
            additional_data: None,
            time_intervals: None,
            received_at: None,
        })
    }

    /// Serializes back to CSV form for the idempotence law
    /// `parse(serialize(report)) == report` (lossy for fields CSV omits,
    /// i.e. imei/status/ignition/gsm/additionalData).
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.device_id,
            self.latitude.unwrap_or_default(),
            self.longitude.unwrap_or_default(),
            self.speed.unwrap_or_default(),
            self.heading.unwrap_or_default(),
            self.timestamp,
        )
    }

    pub fn normalized_ignition(&self) -> Ignition {
        Ignition::normalize(self.ignition.as_deref())
    }

    pub fn decoded_additional_data(&self) -> AdditionalData {
        AdditionalData::from_raw(self.additional_data.as_deref())
    }

    /// `true` when lat/lon are both within 1e-6 of (0,0) — suspicious but
    /// not rejected.
    pub fn is_suspicious_origin(&self) -> bool {
        matches!(
            (self.latitude, self.longitude),
            (Some(lat), Some(lon)) if lat.abs() < 1e-6 && lon.abs() < 1e-6
        )
    }
}

fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        N(f64),
        S(String),
        Null,
    }

    let value = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(NumOrStr::Null) => None,
        Some(NumOrStr::N(n)) => Some(n),
        Some(NumOrStr::S(s)) => {
            let trimmed = s.trim().trim_start_matches('+');
            trimmed.parse::<f64>().ok()
        }
    })
}

fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        N(i64),
        S(String),
        Null,
    }

    let value = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(NumOrStr::Null) => None,
        Some(NumOrStr::N(n)) => Some(n),
        Some(NumOrStr::S(s)) => s.trim().parse::<i64>().ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignition_normalizes_known_tokens() {
        assert_eq!(Ignition::normalize(Some("IGon")), Ignition::On);
        assert_eq!(Ignition::normalize(Some("started")), Ignition::On);
        assert_eq!(Ignition::normalize(Some("whatever")), Ignition::Off);
        assert_eq!(Ignition::normalize(None), Ignition::Off);
        assert_eq!(Ignition::normalize(Some("")), Ignition::Off);
    }

    #[test]
    fn ignition_normalize_is_idempotent() {
        let once = Ignition::normalize(Some("IGon"));
        let twice = Ignition::normalize(Some(once.as_str()));
        assert_eq!(once, twice);
    }

    #[test]
    fn additional_data_decodes_pure_binary() {
        let decoded = AdditionalData::from_raw(Some("10000001"));
        match decoded {
            AdditionalData::Flags(flags) => {
                assert!(flags.speed_crossed);
                assert!(flags.harsh_braking);
                assert!(!flags.roaming);
            }
            other => panic!("expected Flags, got {other:?}"),
        }
    }

    #[test]
    fn additional_data_passes_through_non_binary() {
        let decoded = AdditionalData::from_raw(Some("free text payload"));
        assert_eq!(decoded, AdditionalData::Raw("free text payload".into()));
    }

    #[test]
    fn csv_parses_minimal_and_extended_forms() {
        let minimal = DeviceReport::from_csv("D1,12.97,77.59").unwrap();
        assert_eq!(minimal.device_id, "D1");
        assert_eq!(minimal.latitude, Some(12.97));

        let full =
            DeviceReport::from_csv("D1,12.97,77.59,40,90,2025-06-15 14:30:00").unwrap();
        assert_eq!(full.speed, Some(40.0));
        assert_eq!(full.timestamp, "2025-06-15 14:30:00");
    }

    #[test]
    fn json_accepts_quoted_numerics() {
        let raw = r#"{"deviceId":"D1","imei":"123456789012345","latitude":"12.97","longitude":"77.59","speed":"40","heading":"90","timestamp":"2025-06-15 14:30:00","ignition":"IGon","status":"A"}"#;
        let report: DeviceReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.latitude, Some(12.97));
        assert_eq!(report.speed, Some(40.0));
        assert_eq!(report.normalized_ignition(), Ignition::On);
    }

    #[test]
    fn json_invalid_numeric_becomes_none_not_a_parse_error() {
        let raw = r#"{"deviceId":"D1","imei":"123456789012345","latitude":"200","longitude":"77.59","timestamp":"2025-06-15 14:30:00","status":"A"}"#;
        let report: DeviceReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.latitude, Some(200.0));
    }

    #[test]
    fn suspicious_origin_flagged_within_tolerance() {
        let mut report = DeviceReport::from_csv("D1,0.0000001,-0.0000001").unwrap();
        assert!(report.is_suspicious_origin());
        report.latitude = Some(1.0);
        assert!(!report.is_suspicious_origin());
    }
}
