#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use claims::{assert_none, assert_some};
use futures_util::future::join_all;
use renditions::jobs::{RenderVariant, WorkerContext, CACHE_CONTROL_IMMUTABLE};
use renditions::object_store::InMemoryObjectStore;
use renditions::resolver::{ResolverConfig, VariantResolver};
use renditions::schema::{VariantFormat, VariantRecord, VariantStatus};
use renditions::{Runner, ServiceError};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) struct Harness {
        pub pool: PgPool,
        pub store: Arc<InMemoryObjectStore>,
        pub resolver: VariantResolver,
        _container: ContainerAsync<Postgres>,
    }

    /// Postgres container + in-memory object store + resolver tuned for
    /// fast tests (single attempt per job cycle).
    pub(super) async fn harness() -> anyhow::Result<Harness> {
        let container = Postgres::default().start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let store = Arc::new(InMemoryObjectStore::new());
        let resolver = VariantResolver::new(
            pool.clone(),
            store.clone(),
            ResolverConfig {
                bucket: "images".into(),
                public_base_url: "https://cdn.example.com".into(),
                job_max_attempts: 1,
            },
        );

        Ok(Harness {
            pool,
            store,
            resolver,
            _container: container,
        })
    }

    /// Drain the queue with a short-fused runner sharing the harness
    /// store. A single worker keeps the requeue cycles deterministic.
    pub(super) async fn drain_queue(harness: &Harness, max_requeues: i32) {
        let store: Arc<dyn renditions::object_store::ObjectStore> = harness.store.clone();
        let context = WorkerContext::new(harness.pool.clone(), store, max_requeues)
            .with_job_max_attempts(1);

        let runner = Runner::new(harness.pool.clone(), context)
            .num_workers(1)
            .poll_interval(Duration::from_millis(20))
            .jitter(Duration::from_millis(5))
            .shutdown_when_queue_empty()
            .register::<RenderVariant>();
        runner.start().wait_for_shutdown().await;
    }

    /// A small but genuine PNG.
    pub(super) fn png_bytes() -> Bytes {
        let img = image::ImageBuffer::from_fn(8, 8, |x, y| {
            image::Rgba([(x * 32) as u8, (y * 32) as u8, 128u8, 255u8])
        });
        let mut buffer = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(buffer.into_inner())
    }
}

async fn record_for(
    pool: &PgPool,
    image_id: &str,
    width: i32,
    height: i32,
    format: VariantFormat,
) -> anyhow::Result<Option<VariantRecord>> {
    Ok(renditions::variants::find_by_dimensions(pool, image_id, width, height, format).await?)
}

async fn record_count(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM image_variants")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

async fn job_count(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[tokio::test]
async fn cold_miss_serves_original_and_renders_in_background() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    harness.store.insert("pic.png", test_utils::png_bytes());

    let first = harness
        .resolver
        .resolve_variant("pic.png", Some((4, 2)), Some(VariantFormat::Webp), false)
        .await?;
    assert!(first.serving_original);
    assert!(!first.ready);
    assert_eq!(first.key, "pic.png");

    let record = assert_some!(record_for(&harness.pool, "pic.png", 4, 2, VariantFormat::Webp).await?);
    assert_eq!(record.status, VariantStatus::Queued);
    assert_eq!(record.file_size, 0);
    assert_eq!(record.variant_key, "pic___4x2.webp");

    let token_prefix = sqlx::query_scalar::<_, Option<String>>(
        "SELECT job_id FROM background_jobs LIMIT 1",
    )
    .fetch_one(&harness.pool)
    .await?;
    assert!(assert_some!(token_prefix).starts_with("pic.png_4x2.webp."));

    test_utils::drain_queue(&harness, 2).await;

    let record = assert_some!(record_for(&harness.pool, "pic.png", 4, 2, VariantFormat::Webp).await?);
    assert_eq!(record.status, VariantStatus::Ready);
    assert!(record.file_size > 0);
    assert!(record.completed_at.is_some());

    let rendition = harness.store.options("pic___4x2.webp");
    let rendition = assert_some!(rendition);
    assert_eq!(rendition.content_type, "image/webp");
    assert_eq!(rendition.cache_control, CACHE_CONTROL_IMMUTABLE);

    // Round-trip: the repeat request serves the rendition and admits nothing.
    let second = harness
        .resolver
        .resolve_variant("pic.png", Some((4, 2)), Some(VariantFormat::Webp), false)
        .await?;
    assert!(!second.serving_original);
    assert!(second.ready);
    assert_eq!(second.key, "pic___4x2.webp");
    assert_eq!(job_count(&harness.pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn concurrent_misses_admit_exactly_one_job() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    harness.store.insert("pic.png", test_utils::png_bytes());

    let resolutions = join_all((0..50).map(|_| {
        let resolver = harness.resolver.clone();
        async move {
            resolver
                .resolve_variant("pic.png", Some((4, 4)), Some(VariantFormat::Webp), false)
                .await
        }
    }))
    .await;

    for resolution in resolutions {
        let resolution = resolution?;
        assert!(resolution.serving_original);
        assert!(!resolution.ready);
        assert_eq!(resolution.key, "pic.png");
    }

    assert_eq!(record_count(&harness.pool).await?, 1);
    assert_eq!(job_count(&harness.pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn missing_original_is_rejected_without_admission() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;

    let result = harness
        .resolver
        .resolve_variant("absent.jpg", Some((10, 10)), None, false)
        .await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));

    assert_eq!(record_count(&harness.pool).await?, 0);
    assert_eq!(job_count(&harness.pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn dimensionless_requests_head_check_the_original() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    harness.store.insert("pic.png", test_utils::png_bytes());

    let resolution = harness
        .resolver
        .resolve_variant("pic.png", None, None, false)
        .await?;
    assert!(resolution.serving_original);
    assert!(resolution.ready);
    assert_eq!(resolution.key, "pic.png");
    assert_eq!(record_count(&harness.pool).await?, 0);

    let missing = harness.resolver.resolve_variant("gone.png", None, None, false).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));

    assert_eq!(harness.resolver.get_original("pic.png").await?, "pic.png");
    assert_eq!(
        harness.resolver.public_url("pic___4x2.webp"),
        "https://cdn.example.com/pic___4x2.webp"
    );

    Ok(())
}

#[tokio::test]
async fn force_resize_displaces_a_ready_rendition() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    harness.store.insert("a.jpg", test_utils::png_bytes());

    harness
        .resolver
        .resolve_variant("a.jpg", Some((5, 5)), Some(VariantFormat::Webp), false)
        .await?;
    test_utils::drain_queue(&harness, 2).await;

    let ready = assert_some!(record_for(&harness.pool, "a.jpg", 5, 5, VariantFormat::Webp).await?);
    assert_eq!(ready.status, VariantStatus::Ready);
    assert_some!(harness.store.options("a___5x5.webp"));

    let displaced = harness
        .resolver
        .resolve_variant("a.jpg", Some((5, 5)), Some(VariantFormat::Webp), true)
        .await?;
    assert!(displaced.serving_original);
    assert!(!displaced.ready);

    // The stale rendition is gone, a fresh record is queued under a new id,
    // and a new job is waiting.
    assert_none!(harness.store.options("a___5x5.webp"));
    let requeued = assert_some!(record_for(&harness.pool, "a.jpg", 5, 5, VariantFormat::Webp).await?);
    assert_eq!(requeued.status, VariantStatus::Queued);
    assert_ne!(requeued.id, ready.id);
    assert_eq!(job_count(&harness.pool).await?, 1);

    test_utils::drain_queue(&harness, 2).await;
    let rendered = assert_some!(record_for(&harness.pool, "a.jpg", 5, 5, VariantFormat::Webp).await?);
    assert_eq!(rendered.status, VariantStatus::Ready);

    Ok(())
}

#[tokio::test]
async fn failed_renders_requeue_until_the_cycle_bound() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    // Non-empty but undecodable: download succeeds, render fails every time.
    harness
        .store
        .insert("broken.png", Bytes::from_static(b"this is not a png"));

    harness
        .resolver
        .resolve_variant("broken.png", Some((4, 4)), Some(VariantFormat::Png), false)
        .await?;

    // One attempt per cycle; the queue drains only after the requeue
    // budget (2) is spent: three cycles in total.
    test_utils::drain_queue(&harness, 2).await;

    let record =
        assert_some!(record_for(&harness.pool, "broken.png", 4, 4, VariantFormat::Png).await?);
    assert_eq!(record.status, VariantStatus::Failed);
    assert_eq!(record.requeue_count, 2);
    assert!(assert_some!(record.failed_reason).contains("render failed"));
    assert_some!(record.failed_at);

    // Nothing left in the queue and no rendition was produced.
    assert_eq!(job_count(&harness.pool).await?, 0);
    assert_none!(harness.store.options("broken___4x4.png"));

    // The spent record does not satisfy reads; the next request re-admits.
    let retry = harness
        .resolver
        .resolve_variant("broken.png", Some((4, 4)), Some(VariantFormat::Png), false)
        .await?;
    assert!(retry.serving_original);
    let readmitted =
        assert_some!(record_for(&harness.pool, "broken.png", 4, 4, VariantFormat::Png).await?);
    assert_eq!(readmitted.status, VariantStatus::Queued);
    assert_eq!(readmitted.requeue_count, 0);
    assert_ne!(readmitted.id, record.id);

    Ok(())
}

#[tokio::test]
async fn delete_honors_selectors() -> anyhow::Result<()> {
    let harness = test_utils::harness().await?;
    harness.store.insert("a.jpg", test_utils::png_bytes());

    for (w, h, format) in [
        (5, 5, VariantFormat::Webp),
        (6, 6, VariantFormat::Png),
    ] {
        harness
            .resolver
            .resolve_variant("a.jpg", Some((w, h)), Some(format), false)
            .await?;
    }
    test_utils::drain_queue(&harness, 2).await;
    assert_eq!(record_count(&harness.pool).await?, 2);

    // Full selector removes exactly one variant and its object.
    let removed = harness
        .resolver
        .delete_image("a.jpg", Some((5, 5)), Some(VariantFormat::Webp))
        .await?;
    assert_eq!(removed, 1);
    assert_none!(harness.store.options("a___5x5.webp"));
    assert_some!(harness.store.options("a___6x6.png"));
    assert_eq!(record_count(&harness.pool).await?, 1);

    // No selector removes everything left for the image.
    let removed = harness.resolver.delete_image("a.jpg", None, None).await?;
    assert_eq!(removed, 1);
    assert_none!(harness.store.options("a___6x6.png"));
    assert_eq!(record_count(&harness.pool).await?, 0);

    // The original itself is untouched.
    assert_some!(harness.store.options("a.jpg"));

    // An empty selector match is a 404.
    let result = harness.resolver.delete_image("a.jpg", None, None).await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));

    Ok(())
}
