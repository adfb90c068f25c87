use geo::Rect;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, Envelope, RTree, RTreeObject, SelectionFunction};

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

struct IntersectingWindow {
    window: AABB<[f64; 2]>,
}

impl SelectionFunction<IndexedEnvelope> for IntersectingWindow {
    fn should_unpack_parent(&self, envelope: &AABB<[f64; 2]>) -> bool {
        envelope.intersects(&self.window)
    }

    fn should_unpack_leaf(&self, leaf: &IndexedEnvelope) -> bool {
        leaf.envelope().intersects(&self.window)
    }
}

/// In-memory R-tree over feature envelopes, keyed by position in the owning
/// feature vector. Features without an envelope (empty geometries) are not
/// indexed and therefore never returned as candidates.
pub struct FeatureIndex {
    tree: RTree<IndexedEnvelope>,
}

impl FeatureIndex {
    pub fn build(envelopes: impl IntoIterator<Item = Option<Rect<f64>>>) -> Self {
        let items = envelopes
            .into_iter()
            .enumerate()
            .filter_map(|(position, envelope)| {
                envelope.map(|rect| {
                    let min = rect.min();
                    let max = rect.max();
                    GeomWithData::new(
                        Rectangle::from_corners([min.x, min.y], [max.x, max.y]),
                        position,
                    )
                })
            })
            .collect();
        Self {
            tree: RTree::bulk_load(items),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Positions whose envelope intersects `window`, in ascending order.
    pub fn candidates(&self, window: &Rect<f64>) -> Vec<usize> {
        let min = window.min();
        let max = window.max();
        let selection = IntersectingWindow {
            window: AABB::from_corners([min.x, min.y], [max.x, max.y]),
        };
        let mut positions: Vec<usize> = self
            .tree
            .locate_with_selection_function(selection)
            .map(|item| item.data)
            .collect();
        positions.sort_unstable();
        positions
    }
}

#[cfg(test)]
mod tests {
    use geo::coord;

    use super::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Option<Rect<f64>> {
        Some(Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }))
    }

    #[test]
    fn finds_overlapping_envelopes() {
        let index = FeatureIndex::build(vec![
            rect(0.0, 0.0, 1.0, 1.0),
            None,
            rect(5.0, 5.0, 6.0, 6.0),
            rect(0.5, 0.5, 5.5, 5.5),
        ]);
        assert_eq!(index.len(), 3);
        let window = Rect::new(coord! { x: 0.9, y: 0.9 }, coord! { x: 1.1, y: 1.1 });
        assert_eq!(index.candidates(&window), vec![0, 3]);
        let far = Rect::new(coord! { x: 100.0, y: 100.0 }, coord! { x: 101.0, y: 101.0 });
        assert!(index.candidates(&far).is_empty());
    }

    #[test]
    fn point_envelopes_are_indexed() {
        let index = FeatureIndex::build(vec![rect(2.0, 2.0, 2.0, 2.0)]);
        let window = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 3.0, y: 3.0 });
        assert_eq!(index.candidates(&window), vec![0]);
    }
}
