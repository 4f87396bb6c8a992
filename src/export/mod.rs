pub mod health;

pub use self::health::HealthMetrics;
