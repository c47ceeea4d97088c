/// hiero timestamp.
///
/// Internally i64 microseconds from unix epoch. The NetDB persistence
/// format stores whole seconds, hence the `*_secs` accessors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Construct a timestamp from i64 whole seconds since unix epoch.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Get the i64 whole seconds since unix epoch, truncating.
    pub fn as_secs(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Elapsed time since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: Timestamp) -> std::time::Duration {
        if self.0 <= earlier.0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_micros((self.0 - earlier.0) as u64)
        }
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl std::ops::AddAssign<std::time::Duration> for Timestamp {
    fn add_assign(&mut self, rhs: std::time::Duration) {
        self.0 += rhs.as_micros() as i64;
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .expect("invalid system time")
                .as_micros() as i64,
        )
    }
}

impl From<Timestamp> for std::time::SystemTime {
    fn from(t: Timestamp) -> Self {
        std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_micros(t.0 as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_round_trip_truncates_micros() {
        let t = Timestamp::from_micros(1_234_567_890);
        assert_eq!(1234, t.as_secs());
        assert_eq!(Timestamp::from_secs(1234).as_micros(), 1_234_000_000);
    }

    #[test]
    fn saturating_since_never_underflows() {
        let early = Timestamp::from_secs(10);
        let late = Timestamp::from_secs(12);
        assert_eq!(
            std::time::Duration::from_secs(2),
            late.saturating_since(early)
        );
        assert_eq!(std::time::Duration::ZERO, early.saturating_since(late));
    }
}
