use heapless::Deque;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("epoch {0} cannot be represented")]
    OutOfRange(u64),
    #[error("host clock is before 1970")]
    HostClock,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeSourceError {
    #[error("no network time source")]
    Unavailable,
    #[error("no reply from time server")]
    NoReply,
    #[error("malformed time reply: {0}")]
    Malformed(&'static str),
    #[error("i/o error: {0}")]
    Io(String),
}

/// Epochs are local wall-clock seconds since 1970-01-01 00:00:00.
pub trait Rtc {
    fn now(&self) -> u64;
    fn set(&mut self, epoch: u64) -> Result<(), ClockError>;
}

/// Network time, asked for once and then polled. A reply to an earlier
/// request that arrives after a new `request` is discarded.
pub trait NetworkTimeSource {
    fn request(&mut self) -> Result<(), TimeSourceError>;
    fn poll(&mut self) -> nb::Result<u64, TimeSourceError>;
}

fn host_epoch() -> Result<u64, ClockError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ClockError::HostClock)
}

/// Clock kept as an offset over the host clock. Setting it never touches the
/// host.
#[derive(Debug, Clone)]
pub struct SoftRtc {
    offset_s: i64,
}

impl SoftRtc {
    /// Starts at host UTC shifted by `utc_offset_s`.
    pub fn new(utc_offset_s: i64) -> Self {
        Self {
            offset_s: utc_offset_s,
        }
    }
}

impl Rtc for SoftRtc {
    fn now(&self) -> u64 {
        host_epoch()
            .ok()
            .and_then(|host| host.checked_add_signed(self.offset_s))
            .unwrap_or(0)
    }

    fn set(&mut self, epoch: u64) -> Result<(), ClockError> {
        let host = host_epoch()?;
        let epoch_i = i64::try_from(epoch).map_err(|_| ClockError::OutOfRange(epoch))?;
        let host_i = i64::try_from(host).map_err(|_| ClockError::HostClock)?;
        self.offset_s = epoch_i - host_i;
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualRtc {
    epoch: u64,
    pub commits: u32,
}

impl ManualRtc {
    pub fn new(epoch: u64) -> Self {
        Self { epoch, commits: 0 }
    }

    pub fn advance(&mut self, seconds: u64) {
        self.epoch += seconds;
    }
}

impl Rtc for ManualRtc {
    fn now(&self) -> u64 {
        self.epoch
    }

    fn set(&mut self, epoch: u64) -> Result<(), ClockError> {
        self.epoch = epoch;
        self.commits += 1;
        Ok(())
    }
}

/// Source used when no time server is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTimeSource;

impl NetworkTimeSource for NoTimeSource {
    fn request(&mut self) -> Result<(), TimeSourceError> {
        Err(TimeSourceError::Unavailable)
    }

    fn poll(&mut self) -> nb::Result<u64, TimeSourceError> {
        Err(nb::Error::Other(TimeSourceError::Unavailable))
    }
}

/// Answers requests from a script, one entry per request. `None` never
/// answers; an exhausted script never answers either.
#[derive(Debug, Default)]
pub struct ScriptedTimeSource {
    script: Deque<Option<Result<u64, TimeSourceError>>, 16>,
    current: Option<Result<u64, TimeSourceError>>,
    pub requests: u32,
}

impl ScriptedTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, epoch: u64) -> Self {
        let _ = self.script.push_back(Some(Ok(epoch)));
        self
    }

    pub fn fail(mut self, error: TimeSourceError) -> Self {
        let _ = self.script.push_back(Some(Err(error)));
        self
    }

    pub fn silent(mut self) -> Self {
        let _ = self.script.push_back(None);
        self
    }
}

impl NetworkTimeSource for ScriptedTimeSource {
    fn request(&mut self) -> Result<(), TimeSourceError> {
        self.requests += 1;
        self.current = self.script.pop_front().flatten();
        Ok(())
    }

    fn poll(&mut self) -> nb::Result<u64, TimeSourceError> {
        match self.current.take() {
            Some(Ok(epoch)) => Ok(epoch),
            Some(Err(e)) => Err(nb::Error::Other(e)),
            None => Err(nb::Error::WouldBlock),
        }
    }
}
