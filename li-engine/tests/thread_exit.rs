use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use li_common::{Database, IlsRecord, IlsValue};
use li_engine::with_thread_slot;

static RELEASED: AtomicUsize = AtomicUsize::new(0);
static LEAKED: AtomicUsize = AtomicUsize::new(0);

/// Counts record releases reported by the thread cache.
struct ReleaseCounter;

impl<S: Subscriber> Layer<S> for ReleaseCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() != "li_engine::thread_cache" {
            return;
        }
        match *meta.level() {
            Level::TRACE => RELEASED.fetch_add(1, Ordering::SeqCst),
            Level::ERROR => LEAKED.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }
}

fn record(name: &str) -> IlsRecord {
    IlsRecord::build("s", &[IlsValue::Str(Some(name))]).expect("record")
}

#[test]
fn thread_exit_releases_recycled_records() {
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(ReleaseCounter))
        .expect("subscriber");

    thread::spawn(|| {
        with_thread_slot(Database::User, |slot| {
            slot.recycle(record("alice"));
        })
        .expect("user slot");
        with_thread_slot(Database::Host, |slot| {
            let mut bad = record("broken");
            let header = bad.header_size();
            bad.bytes_mut()[header] ^= 0xff;
            slot.recycle(bad);
        })
        .expect("host slot");

        // Both records are still live while the thread runs.
        assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
        assert_eq!(LEAKED.load(Ordering::SeqCst), 0);
    })
    .join()
    .expect("worker");

    assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    assert_eq!(LEAKED.load(Ordering::SeqCst), 1);
}
