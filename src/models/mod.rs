pub mod alert;
pub mod broadcast_update;
pub mod device_report;
pub mod history_record;
pub mod last_location;
pub mod vehicle;

pub use alert::{AlertEvent, AlertLevel};
pub use broadcast_update::LocationUpdate;
pub use device_report::{AdditionalData, DecodedFlags, DeviceReport, Ignition};
pub use history_record::HistoryRecord;
pub use last_location::LastLocation;
pub use vehicle::Vehicle;
