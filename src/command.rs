use crate::error::ProtocolError;

pub const STATUS_OK: u8 = 1;

/// The single byte a client opens the exchange with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRequest {
    pub flag: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    LastRecords = 0x01,
    RangeQuery = 0x02,
    PushConfig = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(flag: u8) -> Result<Self, Self::Error> {
        match flag {
            0x01 => Ok(Command::LastRecords),
            0x02 => Ok(Command::RangeQuery),
            0x03 => Ok(Command::PushConfig),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    LastN { device_id: i64, count: usize },
    // Not produced until the range command is implemented.
    #[allow(dead_code)]
    Range { device_id: i64, from: i64, to: i64 },
}

/// Pushes a device configuration and reports how many records the device
/// wants back along with a status code.
pub trait ConfigPusher: Send + Sync {
    fn push_config(&self, config: &[u8]) -> (usize, u8);
}

/// Accepts any configuration and always asks for the same number of records.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub record_count: usize,
}

impl ConfigPusher for StaticConfig {
    fn push_config(&self, _config: &[u8]) -> (usize, u8) {
        (self.record_count, STATUS_OK)
    }
}

pub struct CommandResolver {
    default_device_id: i64,
    pusher: Box<dyn ConfigPusher>,
}

impl CommandResolver {
    pub fn new(default_device_id: i64, pusher: Box<dyn ConfigPusher>) -> Self {
        Self {
            default_device_id,
            pusher,
        }
    }

    pub fn resolve(&self, request: ExportRequest) -> Result<Query, ProtocolError> {
        match Command::try_from(request.flag)? {
            Command::LastRecords => {
                // Clients don't send a config payload yet.
                let (count, status) = self.pusher.push_config(&[]);
                if status != STATUS_OK {
                    return Err(ProtocolError::ConfigRejected(status));
                }
                Ok(Query::LastN {
                    device_id: self.default_device_id,
                    count,
                })
            }
            Command::RangeQuery | Command::PushConfig => {
                Err(ProtocolError::NotImplemented(request.flag))
            }
        }
    }
}
