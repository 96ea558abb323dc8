//! The shared-memory video bus: one publisher, up to `slot_count`
//! subscribers, lock-free handoff via a double-buffered seqlock. See
//! `control` for the segment layout, `notifier` for subscriber wakeup, and
//! `discovery` for the `vt-<name>` directory namespace a separate listing
//! utility can enumerate.

mod control;
mod discovery;
mod header;
mod lockfile;
mod mmap;
mod notifier;
mod publisher;
mod subscriber;

pub use control::MAX_SUBSCRIBERS;
pub use discovery::{delete, list, purge_dead_subscribers, CHANNEL_PREFIX};
pub use header::FRAME_HEADER_SIZE;
pub use publisher::{Channel, ChannelInfo, ChannelPublisher, SlotInfo};
pub use subscriber::Subscription;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn publish_then_peek_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Channel::create(tmp.path(), "cam0", 4096, 4, b"{}").unwrap();
        let publisher = channel.publisher();
        publisher.publish(b"frame-one", "raw", 1_700_000_000, 0).unwrap();

        let sub = Subscription::open(tmp.path(), "cam0").unwrap();
        let (bytes, type_str, _, _) = sub.peek().unwrap().unwrap();
        assert_eq!(bytes, b"frame-one");
        assert_eq!(type_str, "raw");
    }

    #[test]
    fn receive_drops_to_latest_when_frames_pile_up() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Channel::create(tmp.path(), "cam1", 4096, 4, b"").unwrap();
        let publisher = channel.publisher();
        let mut sub = Subscription::open(tmp.path(), "cam1").unwrap();

        publisher.publish(b"one", "raw", 0, 0).unwrap();
        publisher.publish(b"two", "raw", 0, 0).unwrap();
        publisher.publish(b"three", "raw", 0, 0).unwrap();

        let (bytes, _, _, _) = sub.receive().unwrap();
        assert_eq!(bytes, b"three");
    }

    #[test]
    fn payload_over_max_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Channel::create(tmp.path(), "cam2", 4, 2, b"").unwrap();
        let publisher = channel.publisher();
        let err = publisher.publish(b"too-big", "raw", 0, 0).unwrap_err();
        assert!(matches!(err, crate::Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn second_publisher_on_same_name_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = Channel::create(tmp.path(), "cam3", 1024, 2, b"").unwrap();
        let second = Channel::create(tmp.path(), "cam3", 1024, 2, b"");
        assert!(matches!(second, Err(crate::Error::PublisherAlreadyActive(_))));
    }

    #[test]
    fn dead_subscriber_does_not_block_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Channel::create(tmp.path(), "cam4", 1024, 1, b"").unwrap();
        let publisher = channel.publisher();
        {
            let _sub = Subscription::open(tmp.path(), "cam4").unwrap();
            // subscriber dropped here without ever calling receive()
        }
        publisher.publish(b"after-drop", "raw", 0, 0).unwrap();
        let sub2 = Subscription::open(tmp.path(), "cam4").unwrap();
        assert!(sub2.peek().unwrap().is_some());
    }

    #[test]
    fn list_enumerates_created_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let _channel = Channel::create(tmp.path(), "cam5", 1024, 1, b"").unwrap();
        let names = list(tmp.path()).unwrap();
        assert!(names.contains(&"cam5".to_string()));
    }

    #[test]
    fn slow_subscriber_eventually_sees_latest_without_blocking_publisher() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Channel::create(tmp.path(), "cam6", 1024, 1, b"").unwrap();
        let publisher = channel.publisher();
        let mut sub = Subscription::open(tmp.path(), "cam6").unwrap();
        for i in 0..5u8 {
            publisher.publish(&[i], "raw", 0, 0).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        let (bytes, _, _, _) = sub.receive().unwrap();
        assert_eq!(bytes, vec![4]);
    }
}
