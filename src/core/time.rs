use time::{OffsetDateTime, PrimitiveDateTime};

/// Timestamps are stored as UTC `TIMESTAMP` columns without an offset.
pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_now_tracks_wall_clock_utc() {
        let before = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        let now = primitive_now_utc().assume_utc();
        let after = OffsetDateTime::now_utc();
        assert!(now >= before);
        assert!(now <= after);
    }
}
