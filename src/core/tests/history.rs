mod common;

use common::{Fixture, grid, test_config};
use layerfilter::{FilterRequest, HostLayers, LayerRef, ReferenceSource};
use layerfilter_spatial::SpatialRelation;

const AREA: &str = "POLYGON((25 25,125 25,125 95,25 95,25 25))";

fn area() -> anyhow::Result<FilterRequest> {
    Ok(FilterRequest::spatial(
        SpatialRelation::Intersects,
        ReferenceSource::wkt(AREA)?,
    ))
}

async fn apply(fixture: &Fixture, layer: &LayerRef, request: FilterRequest) -> anyhow::Result<String> {
    let result = fixture
        .service
        .submit_filter(layer.clone(), request)
        .wait()
        .await?;
    Ok(result.subset)
}

#[tokio::test]
async fn test_undo_walks_back_one_step_at_a_time() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    for layer in fixture.layers() {
        let first = apply(&fixture, layer, area()?).await?;
        let second = apply(&fixture, layer, FilterRequest::attribute("speed > 50").at_step(1)).await?;
        assert_ne!(first, second);
        assert_eq!(fixture.host.get_subset(&layer.id), Some(second));

        assert!(fixture.service.undo_last_step(&layer.id).await?);
        assert_eq!(fixture.host.get_subset(&layer.id), Some(first));
        assert!(fixture.service.undo_last_step(&layer.id).await?);
        assert_eq!(fixture.host.get_subset(&layer.id), None);
        assert!(!fixture.service.undo_last_step(&layer.id).await?);
    }
    Ok(())
}

#[tokio::test]
async fn test_reset_restores_subset_before_first_step() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let layer = fixture.embedded_layer.clone();
    fixture.host.set_subset(&layer.id, Some("\"speed\" > 20"));

    apply(&fixture, &layer, area()?).await?;
    apply(&fixture, &layer, FilterRequest::attribute("kind = 'road'").at_step(1)).await?;
    // A new chain replaces the steps but not the origin.
    apply(&fixture, &layer, FilterRequest::attribute("kind = 'rail'")).await?;
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 1);

    fixture.service.reset(&layer.id).await?;
    assert_eq!(fixture.host.get_subset(&layer.id).as_deref(), Some("\"speed\" > 20"));
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 0);
    assert!(!fixture.service.undo_last_step(&layer.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_chained_step_on_empty_history_starts_a_chain() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let layer = fixture.generic_layer.clone();
    let result = fixture
        .service
        .submit_filter(layer.clone(), FilterRequest::attribute("kind = 'rail'").at_step(3))
        .wait()
        .await?;
    assert_eq!(result.feature_count, Some(133));
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_mutation_rebuilds_the_chain_on_fresh_views() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let layer = fixture.server_layer.clone();

    apply(&fixture, &layer, area()?).await?;
    assert_eq!(fixture.server.creates(), 1);
    let before = apply(&fixture, &layer, area()?).await?;
    assert_eq!(fixture.server.creates(), 1, "second identical request is a cache hit");

    let dropped = fixture.service.notify_layer_mutated(&layer.id).await;
    assert_eq!(dropped, 1);
    assert_eq!(fixture.server.drops(), 1);
    assert_eq!(fixture.server.creates(), 2);
    assert_eq!(fixture.server.view_count(), 1);

    let rebuilt = fixture.host.get_subset(&layer.id).unwrap_or_default();
    assert_ne!(rebuilt, before);
    assert!(rebuilt.contains("lf_mv_"), "{rebuilt}");
    assert!(fixture.server.subset_is_live(&rebuilt), "{rebuilt}");
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 1);

    // The next step composes on the rebuilt view.
    let stepped = fixture
        .service
        .submit_filter(layer.clone(), FilterRequest::attribute("speed > 50").at_step(1))
        .wait()
        .await?;
    assert_eq!(fixture.server.creates(), 3);
    assert!(fixture.server.subset_is_live(&stepped.subset));

    let flattened = fixture
        .service
        .submit_filter(fixture.generic_layer.clone(), area()?.with_attribute("speed > 50"))
        .wait()
        .await?;
    assert_eq!(stepped.feature_count, flattened.feature_count);
    Ok(())
}

#[tokio::test]
async fn test_mutation_filters_the_changed_rows() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let layer = fixture.server_layer.clone();
    let first = fixture
        .service
        .submit_filter(layer.clone(), area()?)
        .wait()
        .await?;
    assert_eq!(first.feature_count, Some(70));

    let remaining: Vec<_> = grid(20, 10.0).into_iter().filter(|f| f.id % 2 == 0).collect();
    fixture.server.add_table("public.parcels_server", remaining.clone());
    fixture.host.replace_features(&fixture.generic_layer.id, remaining);
    fixture.service.notify_layer_mutated(&layer.id).await;

    let expected = fixture
        .service
        .submit_filter(fixture.generic_layer.clone(), area()?)
        .wait()
        .await?
        .feature_count;
    let subset = fixture.host.get_subset(&layer.id).unwrap_or_default();
    assert_eq!(fixture.server.selected_rows(&subset), expected);
    assert!(expected.is_some_and(|count| count < 70));
    Ok(())
}

#[tokio::test]
async fn test_failed_rebuild_restores_the_original_subset() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    let layer = fixture.server_layer.clone();
    fixture.host.set_subset(&layer.id, Some("\"speed\" > 20"));

    apply(&fixture, &layer, area()?).await?;
    apply(&fixture, &layer, FilterRequest::attribute("kind = 'road'").at_step(1)).await?;

    fixture.server.fail_creates(true);
    fixture.service.notify_layer_mutated(&layer.id).await;
    assert_eq!(fixture.host.get_subset(&layer.id).as_deref(), Some("\"speed\" > 20"));
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 0);
    assert_eq!(fixture.server.view_count(), 0);
    assert!(!fixture.service.undo_last_step(&layer.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_mutation_without_history_leaves_subset_alone() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(10, 10.0), test_config())?;
    for layer in fixture.layers() {
        fixture.host.set_subset(&layer.id, Some("speed > 20"));
        assert_eq!(fixture.service.notify_layer_mutated(&layer.id).await, 0);
        assert_eq!(fixture.host.get_subset(&layer.id).as_deref(), Some("speed > 20"));
    }
    Ok(())
}

#[tokio::test]
async fn test_shutdown_restores_original_subsets() -> anyhow::Result<()> {
    let fixture = Fixture::new(grid(20, 10.0), test_config())?;
    for layer in fixture.layers() {
        fixture.host.set_subset(&layer.id, Some("\"speed\" > 20"));
        apply(&fixture, layer, area()?).await?;
        apply(&fixture, layer, FilterRequest::attribute("kind = 'rail'").at_step(1)).await?;
    }
    assert_eq!(fixture.server.view_count(), 2);

    fixture.service.shutdown().await;
    for layer in fixture.layers() {
        assert_eq!(fixture.host.get_subset(&layer.id).as_deref(), Some("\"speed\" > 20"));
    }
    assert_eq!(fixture.server.view_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_history_depth_evicts_oldest_steps() -> anyhow::Result<()> {
    let config = test_config().with_history_depth(2);
    let fixture = Fixture::new(grid(20, 10.0), config)?;
    let layer = fixture.generic_layer.clone();

    let first = apply(&fixture, &layer, area()?).await?;
    apply(&fixture, &layer, FilterRequest::attribute("speed > 20").at_step(1)).await?;
    apply(&fixture, &layer, FilterRequest::attribute("kind = 'road'").at_step(2)).await?;
    assert_eq!(fixture.service.engine().history_len(&layer.id).await, 2);

    assert!(fixture.service.undo_last_step(&layer.id).await?);
    assert!(fixture.service.undo_last_step(&layer.id).await?);
    assert_eq!(fixture.host.get_subset(&layer.id), Some(first));
    assert!(!fixture.service.undo_last_step(&layer.id).await?);

    // The origin outlives eviction.
    fixture.service.reset(&layer.id).await?;
    assert_eq!(fixture.host.get_subset(&layer.id), None);
    Ok(())
}
