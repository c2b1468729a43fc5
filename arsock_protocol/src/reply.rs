use bytes::Bytes;
use strum_macros::{Display, EnumString};

/// How a request was completed.
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumString)]
pub enum ReplyStatus {
    #[strum(serialize = "success")]
    Success,
    /// No address was known, the connect failed, or the send failed.
    #[strum(serialize = "host_unreachable")]
    HostUnreachable,
    /// The request was force-resolved by teardown or address invalidation.
    #[strum(serialize = "torn_down")]
    TornDown,
}

/// The single outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub frames: Vec<Bytes>,
}

impl Reply {
    pub fn success(frames: Vec<Bytes>) -> Self {
        Reply {
            status: ReplyStatus::Success,
            frames,
        }
    }

    pub fn failure(status: ReplyStatus) -> Self {
        Reply {
            status,
            frames: Vec::new(),
        }
    }

    pub fn host_unreachable() -> Self {
        Self::failure(ReplyStatus::HostUnreachable)
    }

    pub fn torn_down() -> Self {
        Self::failure(ReplyStatus::TornDown)
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names() {
        assert_eq!("host_unreachable", ReplyStatus::HostUnreachable.to_string());
        assert_eq!(
            ReplyStatus::TornDown,
            "torn_down".parse::<ReplyStatus>().unwrap()
        );
    }

    #[test]
    fn failures_carry_no_frames() {
        let reply = Reply::torn_down();
        assert!(!reply.is_success());
        assert!(reply.frames.is_empty());
    }
}
