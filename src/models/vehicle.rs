use serde::{Deserialize, Serialize};

/// Vehicle record as known to the external administration store. The
/// core only ever reads and, on first-bind, writes `device_id` — every
/// other field is owned by the out-of-scope admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vehicle {
    pub vehicle_id: i64,
    pub imei: String,
    pub device_id: Option<String>,
    pub vehicle_number: Option<String>,
}

impl Vehicle {
    /// Invariant I3: once bound, `device_id` is stable. A report whose
    /// `device_id` disagrees with an already-bound vehicle is a
    /// binding mismatch, not a rebind.
    pub fn binding_conflicts_with(&self, reported_device_id: &str) -> bool {
        match &self.device_id {
            Some(bound) => bound != reported_device_id,
            None => false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.device_id.is_some()
    }

    /// Returns a copy with `device_id` bound, for first-time binding.
    pub fn with_bound_device_id(&self, device_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.device_id = Some(device_id.into());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(device_id: Option<&str>) -> Vehicle {
        Vehicle {
            vehicle_id: 1,
            imei: "123456789012345".into(),
            device_id: device_id.map(|s| s.to_string()),
            vehicle_number: Some("ABC-123".into()),
        }
    }

    #[test]
    fn unbound_vehicle_never_conflicts() {
        let v = vehicle(None);
        assert!(!v.binding_conflicts_with("D1"));
    }

    #[test]
    fn bound_vehicle_conflicts_on_mismatch() {
        let v = vehicle(Some("D1"));
        assert!(!v.binding_conflicts_with("D1"));
        assert!(v.binding_conflicts_with("D2"));
    }
}
