pub mod vehicle_cache;

pub use vehicle_cache::VehicleCache;
