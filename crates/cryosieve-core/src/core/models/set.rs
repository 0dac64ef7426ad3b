use super::particle::{ImageLocator, ParticleRecord};
use super::table::ParticleTable;
use crate::core::io::star::{StarError, StarFile};
use rand::Rng;
use rand::seq::index::sample;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// An ordered view over the rows of a shared [`ParticleTable`].
///
/// Views never copy particle data. Subsetting, splitting and balancing only
/// produce new index sequences referring to the same immutable backing table,
/// which keeps the derived parameters of every row identical across views.
#[derive(Debug, Clone)]
pub struct ParticleSet {
    table: Arc<ParticleTable>,
    rows: Vec<usize>,
}

impl ParticleSet {
    /// Creates a view over every row of the table, in file order.
    pub fn new(table: ParticleTable) -> Self {
        Self::from_shared(Arc::new(table))
    }

    /// Creates a view over every row of an already shared table.
    pub fn from_shared(table: Arc<ParticleTable>) -> Self {
        let rows = (0..table.len()).collect();
        Self { table, rows }
    }

    fn with_rows(&self, rows: Vec<usize>) -> Self {
        Self {
            table: Arc::clone(&self.table),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn table(&self) -> &ParticleTable {
        &self.table
    }

    pub fn shared_table(&self) -> Arc<ParticleTable> {
        Arc::clone(&self.table)
    }

    /// Table row indices of the view, in view order.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Table row index of the particle at `position` in this view.
    pub fn row(&self, position: usize) -> usize {
        self.rows[position]
    }

    pub fn record(&self, position: usize) -> &ParticleRecord {
        &self.table.records()[self.rows[position]]
    }

    pub fn image(&self, position: usize) -> Option<&ImageLocator> {
        self.table.image(self.rows[position])
    }

    pub fn half_set_of(&self, position: usize) -> u32 {
        self.table.half_sets()[self.rows[position]]
    }

    /// Distinct half-set ids present in the view, ascending.
    pub fn half_set_ids(&self) -> Vec<u32> {
        self.half_set_sizes().into_keys().collect()
    }

    /// Number of particles per half-set id, ordered by ascending id.
    pub fn half_set_sizes(&self) -> BTreeMap<u32, usize> {
        let half_sets = self.table.half_sets();
        let mut sizes = BTreeMap::new();
        for &row in &self.rows {
            *sizes.entry(half_sets[row]).or_insert(0) += 1;
        }
        sizes
    }

    /// Particles of one half-set, preserving view order.
    pub fn half_set(&self, id: u32) -> Self {
        let half_sets = self.table.half_sets();
        let rows = self
            .rows
            .iter()
            .copied()
            .filter(|&row| half_sets[row] == id)
            .collect();
        self.with_rows(rows)
    }

    /// Keeps the particles whose mask entry is `true`.
    ///
    /// # Panics
    ///
    /// Panics if the mask length differs from the view length.
    pub fn subset_by_mask(&self, mask: &[bool]) -> Self {
        assert_eq!(mask.len(), self.rows.len(), "mask length must match view length");
        let rows = self
            .rows
            .iter()
            .zip(mask)
            .filter_map(|(&row, &keep)| keep.then_some(row))
            .collect();
        self.with_rows(rows)
    }

    /// Splits the view into the `true` and `false` parts of the mask.
    ///
    /// # Panics
    ///
    /// Panics if the mask length differs from the view length.
    pub fn split(&self, mask: &[bool]) -> (Self, Self) {
        assert_eq!(mask.len(), self.rows.len(), "mask length must match view length");
        let (kept, dropped): (Vec<_>, Vec<_>) = self
            .rows
            .iter()
            .zip(mask)
            .partition(|&(_, &keep)| keep);
        (
            self.with_rows(kept.into_iter().map(|(&row, _)| row).collect()),
            self.with_rows(dropped.into_iter().map(|(&row, _)| row).collect()),
        )
    }

    /// Picks particles by their positions in this view, in the given order.
    pub fn select(&self, positions: &[usize]) -> Self {
        self.with_rows(positions.iter().map(|&p| self.rows[p]).collect())
    }

    /// Rows of this view that are absent from `other`, in this view's order.
    pub fn difference(&self, other: &ParticleSet) -> Self {
        let excluded: HashSet<usize> = other.rows.iter().copied().collect();
        let rows = self
            .rows
            .iter()
            .copied()
            .filter(|row| !excluded.contains(row))
            .collect();
        self.with_rows(rows)
    }

    /// Returns the view with its rows in ascending table order.
    pub fn in_file_order(&self) -> Self {
        let mut rows = self.rows.clone();
        rows.sort_unstable();
        self.with_rows(rows)
    }

    /// Down-samples every half-set to the size of the smallest one.
    ///
    /// Each half-set is sampled uniformly without replacement; the surviving
    /// rows are returned in ascending table order. Applying the operation to an
    /// already balanced view keeps every row.
    pub fn balance<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let sizes = self.half_set_sizes();
        let Some(&target) = sizes.values().min() else {
            return self.clone();
        };

        let mut rows = Vec::with_capacity(target * sizes.len());
        for &id in sizes.keys() {
            let members = self.half_set(id).rows;
            if members.len() == target {
                rows.extend(members);
            } else {
                rows.extend(sample(rng, members.len(), target).into_iter().map(|i| members[i]));
            }
        }
        rows.sort_unstable();
        self.with_rows(rows)
    }

    /// Writes the view to a STAR file in the schema of its backing table.
    pub fn save(&self, path: &Path) -> Result<(), StarError> {
        StarFile::save(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::particle::CtfParams;
    use crate::core::models::table::{Schema, SourceText};
    use nalgebra::{UnitQuaternion, Vector2};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::path::PathBuf;

    fn table_with_half_sets(half_sets: &[u32]) -> ParticleTable {
        let n = half_sets.len();
        let record = ParticleRecord {
            shift: Vector2::zeros(),
            orientation: UnitQuaternion::identity(),
            ctf: CtfParams {
                voltage: 300_000.0,
                defocus_u: 10_000.0,
                defocus_v: 10_000.0,
                astigmatism: 0.0,
                spherical_aberration: 2.7e7,
                amplitude_contrast: 0.1,
                phase_shift: 0.0,
                pixel_size: 1.0,
            },
        };
        let images = (0..n)
            .map(|i| ImageLocator {
                slice: i,
                path: PathBuf::from("stack.mrcs"),
            })
            .collect();
        let source = SourceText {
            lines: (0..n).map(|i| format!("row {i}\n")).collect(),
            row_lines: (0..n).collect(),
        };
        ParticleTable::new(
            Schema::Legacy,
            vec![record; n],
            images,
            half_sets.to_vec(),
            PathBuf::new(),
            source,
        )
    }

    #[test]
    fn half_set_ids_are_distinct_and_ascending() {
        let set = ParticleSet::new(table_with_half_sets(&[2, 1, 2, 3, 1]));
        assert_eq!(set.half_set_ids(), vec![1, 2, 3]);
        assert_eq!(set.half_set(2).rows(), &[0, 2]);
    }

    #[test]
    fn split_is_disjoint_and_exhaustive() {
        let set = ParticleSet::new(table_with_half_sets(&[1; 6]));
        let mask = [true, false, true, true, false, false];
        let (kept, dropped) = set.split(&mask);
        assert_eq!(kept.rows(), &[0, 2, 3]);
        assert_eq!(dropped.rows(), &[1, 4, 5]);
        assert_eq!(kept.len() + dropped.len(), set.len());
    }

    #[test]
    fn nested_views_map_back_to_table_rows() {
        let set = ParticleSet::new(table_with_half_sets(&[1, 2, 1, 2, 1, 2]));
        let second = set.half_set(2);
        let picked = second.select(&[2, 0]);
        assert_eq!(picked.rows(), &[5, 1]);
        assert_eq!(picked.in_file_order().rows(), &[1, 5]);
        assert_eq!(second.difference(&picked).rows(), &[3]);
    }

    #[test]
    fn balance_equalises_half_sets_to_the_smallest() {
        let mut half_sets = vec![1; 30];
        half_sets.extend(vec![2; 12]);
        half_sets.extend(vec![3; 20]);
        let set = ParticleSet::new(table_with_half_sets(&half_sets));
        let mut rng = StdRng::seed_from_u64(7);

        let balanced = set.balance(&mut rng);

        for (_, size) in balanced.half_set_sizes() {
            assert_eq!(size, 12);
        }
        assert!(balanced.rows().windows(2).all(|w| w[0] < w[1]));
        let again = balanced.balance(&mut rng);
        assert_eq!(again.rows(), balanced.rows());
    }

    #[test]
    #[should_panic(expected = "mask length")]
    fn mask_of_wrong_length_is_rejected() {
        let set = ParticleSet::new(table_with_half_sets(&[1, 1]));
        set.subset_by_mask(&[true]);
    }
}
