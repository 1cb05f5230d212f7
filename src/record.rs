use chrono::Utc;

/// One sensor reading as stored by the ingestion side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: i64,
    pub temperature: f32,
    pub humidity: f32,
    pub water_level: f32,
    /// Seconds since the Unix epoch. Only used for ordering and filtering.
    pub timestamp: i64,
}

impl TelemetryRecord {
    pub fn new(device_id: i64, temperature: f32, humidity: f32, water_level: f32) -> Self {
        Self {
            device_id,
            temperature,
            humidity,
            water_level,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The measurements that go on the wire, in wire order.
    pub fn fields(&self) -> [(&'static str, f32); 3] {
        [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("water_level", self.water_level),
        ]
    }
}
