mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{Fixture, grid, test_config};
use layerfilter::{CleanupCallback, FilterRequest, ReferenceSource, TaskStatus};
use layerfilter_spatial::SpatialRelation;
use parking_lot::Mutex;

const AREA: &str = "POLYGON((25 25,125 25,125 95,25 95,25 25))";

/// Stands in for a UI signal handler that is muted while a filter runs.
#[derive(Default)]
struct Listener {
    enabled: AtomicBool,
    reconnects: AtomicUsize,
    statuses: Mutex<Vec<TaskStatus>>,
}

impl Listener {
    fn mute(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// The reconnect runs only when the handler was actually disconnected.
    fn cleanup(self: &Arc<Self>) -> CleanupCallback {
        let listener = Arc::clone(self);
        Box::new(move |status| {
            if !listener.enabled.swap(true, Ordering::SeqCst) {
                listener.reconnects.fetch_add(1, Ordering::SeqCst);
            }
            listener.statuses.lock().push(status);
        })
    }
}

fn request() -> anyhow::Result<FilterRequest> {
    Ok(FilterRequest::spatial(
        SpatialRelation::Intersects,
        ReferenceSource::wkt(AREA)?,
    ))
}

#[tokio::test]
async fn test_cleanup_runs_once_on_success() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let listener = Arc::new(Listener::default());
    listener.mute();

    let handle = fixture.service.submit_filter_with_cleanup(
        fixture.embedded_layer.clone(),
        request()?,
        vec![listener.cleanup()],
    );
    handle.wait().await?;
    assert!(listener.enabled.load(Ordering::SeqCst));
    assert_eq!(listener.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.statuses.lock(), vec![TaskStatus::Succeeded]);
    Ok(())
}

#[tokio::test]
async fn test_cleanup_runs_once_on_failure() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let listener = Arc::new(Listener::default());
    listener.mute();

    fixture.server.fail_creates(true);
    let handle = fixture.service.submit_filter_with_cleanup(
        fixture.server_layer.clone(),
        request()?,
        vec![listener.cleanup()],
    );
    assert!(handle.wait().await.is_err());
    assert!(listener.enabled.load(Ordering::SeqCst));
    assert_eq!(listener.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.statuses.lock(), vec![TaskStatus::Failed]);
    Ok(())
}

#[tokio::test]
async fn test_cleanup_runs_once_on_cancel() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let listener = Arc::new(Listener::default());
    listener.mute();

    fixture.server.set_create_delay(Some(Duration::from_millis(200)));
    let handle = fixture.service.submit_filter_with_cleanup(
        fixture.server_layer.clone(),
        request()?,
        vec![listener.cleanup()],
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    assert!(handle.wait().await.unwrap_err().is_cancelled());
    assert!(listener.enabled.load(Ordering::SeqCst));
    assert_eq!(listener.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.statuses.lock(), vec![TaskStatus::Cancelled]);
    Ok(())
}

#[tokio::test]
async fn test_cleanup_with_false_guard_does_nothing() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(10, 10.0), test_config())?;
    let listener = Arc::new(Listener::default());
    listener.enabled.store(true, Ordering::SeqCst);

    let handle = fixture.service.submit_filter_with_cleanup(
        fixture.generic_layer.clone(),
        request()?,
        vec![listener.cleanup()],
    );
    handle.wait().await?;
    assert!(listener.enabled.load(Ordering::SeqCst));
    assert_eq!(listener.reconnects.load(Ordering::SeqCst), 0);
    assert_eq!(listener.statuses.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_every_cleanup_runs_before_terminal_state_is_visible() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(10, 10.0), test_config())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let cleanups: Vec<CleanupCallback> = (0..3)
        .map(|_| -> CleanupCallback {
            let calls = Arc::clone(&calls);
            Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let handle = fixture.service.submit_filter_with_cleanup(
        fixture.generic_layer.clone(),
        FilterRequest::attribute("kind = 'rail'"),
        cleanups,
    );
    handle.wait().await?;
    assert_eq!(handle.status(), TaskStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}
