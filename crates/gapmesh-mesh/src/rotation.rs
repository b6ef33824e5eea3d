//! Deterministic hourly rotation of the advertised BLE service UUID.
//!
//! Every device derives the same UUID for the same hour bucket, so peers
//! find each other without a directory while a static observer cannot track
//! one fixed UUID across days. Near a bucket boundary both the current and
//! next UUID are in play, so clocks a few minutes apart still intersect.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Milliseconds per rotation bucket.
pub const BUCKET_MILLIS: u64 = 3_600_000;

/// The overlap window at the end of a bucket during which the next bucket's
/// UUID is also advertised and scanned.
pub const OVERLAP_MILLIS: u64 = 5 * 60 * 1000;

/// Domain-separation prefix fed to the derivation HMAC.
const DERIVATION_PREFIX: &str = "gap-mesh-ble-uuid-v1-";

/// Seed string for the project-wide rotation secret.
const ROTATION_SEED: &str = "gap-mesh-global-rotation-v1";

/// Constant UUID advertised alongside the rotating set when legacy
/// compatibility is enabled.
pub const LEGACY_SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B_5E2D_4A9E_4C5A_9B3F_8E1D_2C3A_4B5C);

/// The single writable+notifiable characteristic every gapmesh peripheral
/// exposes.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2_C3D4_E5F6_4A5B_8C9D_0E1F_2A3B_4C5D);

/// Rotating service-UUID derivation.
///
/// Stateless aside from its configuration; all methods take the wall clock
/// in Unix milliseconds so two instances with the same clock agree bit for
/// bit.
#[derive(Debug, Clone)]
pub struct UuidRotator {
    secret: [u8; 32],
    legacy_compatibility: bool,
}

impl UuidRotator {
    /// Rotator with the project-wide deterministic secret.
    #[must_use]
    pub fn new(legacy_compatibility: bool) -> Self {
        let digest = Sha256::digest(ROTATION_SEED.as_bytes());
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&digest);
        Self {
            secret,
            legacy_compatibility,
        }
    }

    /// Bucket index for a wall-clock time.
    #[must_use]
    pub fn bucket(unix_millis: u64) -> u64 {
        unix_millis / BUCKET_MILLIS
    }

    /// True inside the last five minutes of the bucket.
    #[must_use]
    pub fn in_overlap_window(unix_millis: u64) -> bool {
        unix_millis % BUCKET_MILLIS >= BUCKET_MILLIS - OVERLAP_MILLIS
    }

    /// Service UUID for an absolute bucket index.
    #[must_use]
    pub fn uuid_for_bucket(&self, bucket: u64) -> Uuid {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(DERIVATION_PREFIX.as_bytes());
        mac.update(bucket.to_string().as_bytes());
        let tag = mac.finalize().into_bytes();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&tag[..16]);
        // Stamp RFC 4122 version 4 and variant bits so the value is a legal
        // random-form UUID to every BLE stack.
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// UUIDs to advertise right now: current bucket, plus the next one
    /// during the overlap window.
    #[must_use]
    pub fn transmit_set(&self, unix_millis: u64) -> Vec<Uuid> {
        let bucket = Self::bucket(unix_millis);
        let mut set = vec![self.uuid_for_bucket(bucket)];
        if Self::in_overlap_window(unix_millis) {
            set.push(self.uuid_for_bucket(bucket + 1));
        }
        set
    }

    /// UUIDs to scan for right now: current and previous bucket, the next
    /// one during the overlap window, and the legacy constant when enabled.
    #[must_use]
    pub fn scan_set(&self, unix_millis: u64) -> Vec<Uuid> {
        let bucket = Self::bucket(unix_millis);
        let mut set = vec![self.uuid_for_bucket(bucket)];
        if let Some(previous) = bucket.checked_sub(1) {
            set.push(self.uuid_for_bucket(previous));
        }
        if Self::in_overlap_window(unix_millis) {
            set.push(self.uuid_for_bucket(bucket + 1));
        }
        if self.legacy_compatibility {
            set.push(LEGACY_SERVICE_UUID);
        }
        set
    }

    /// Milliseconds until the transmit set next changes (bucket boundary or
    /// overlap-window start), for scheduling re-advertisement.
    #[must_use]
    pub fn next_change_in(unix_millis: u64) -> u64 {
        let into_bucket = unix_millis % BUCKET_MILLIS;
        let overlap_start = BUCKET_MILLIS - OVERLAP_MILLIS;
        if into_bucket < overlap_start {
            overlap_start - into_bucket
        } else {
            BUCKET_MILLIS - into_bucket
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = BUCKET_MILLIS;

    #[test]
    fn derivation_is_deterministic() {
        let a = UuidRotator::new(false);
        let b = UuidRotator::new(false);
        assert_eq!(a.uuid_for_bucket(491_000), b.uuid_for_bucket(491_000));
        assert_ne!(a.uuid_for_bucket(491_000), a.uuid_for_bucket(491_001));
    }

    #[test]
    fn uuids_are_rfc4122_v4_form() {
        let rotator = UuidRotator::new(false);
        let id = rotator.uuid_for_bucket(12345);
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn scan_set_spans_boundary() {
        let rotator = UuidRotator::new(false);
        // One second before a bucket boundary.
        let t = 500 * HOUR - 1000;
        let scan = rotator.scan_set(t);
        assert!(scan.contains(&rotator.uuid_for_bucket(499)));
        assert!(scan.contains(&rotator.uuid_for_bucket(498)));
        assert!(scan.contains(&rotator.uuid_for_bucket(500)), "next bucket visible in overlap");
    }

    #[test]
    fn transmit_set_minimal_outside_overlap() {
        let rotator = UuidRotator::new(false);
        let t = 500 * HOUR + 10 * 60 * 1000; // ten minutes into the bucket
        assert_eq!(rotator.transmit_set(t), vec![rotator.uuid_for_bucket(500)]);
        assert!(!UuidRotator::in_overlap_window(t));
    }

    #[test]
    fn devices_six_minutes_apart_intersect() {
        // X near the end of bucket b, Y just after the boundary.
        let rotator = UuidRotator::new(false);
        let x_time = 500 * HOUR - 4 * 60 * 1000;
        let y_time = x_time + 6 * 60 * 1000;
        let x_scan = rotator.scan_set(x_time);
        let y_tx = rotator.transmit_set(y_time);
        assert!(y_tx.iter().any(|u| x_scan.contains(u)));
        let y_scan = rotator.scan_set(y_time);
        let x_tx = rotator.transmit_set(x_time);
        assert!(x_tx.iter().any(|u| y_scan.contains(u)));
    }

    #[test]
    fn legacy_uuid_present_only_when_enabled() {
        let t = 123 * HOUR;
        assert!(UuidRotator::new(true).scan_set(t).contains(&LEGACY_SERVICE_UUID));
        assert!(!UuidRotator::new(false).scan_set(t).contains(&LEGACY_SERVICE_UUID));
    }

    #[test]
    fn change_schedule_tracks_overlap() {
        let t = 500 * HOUR;
        assert_eq!(UuidRotator::next_change_in(t), BUCKET_MILLIS - OVERLAP_MILLIS);
        let late = 500 * HOUR + BUCKET_MILLIS - OVERLAP_MILLIS + 1;
        assert_eq!(UuidRotator::next_change_in(late), OVERLAP_MILLIS - 1);
    }
}
