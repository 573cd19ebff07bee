//! Monte Carlo resampling of hypocenter locations.
//!
//! Draw `i` is generated by a ChaCha8 generator seeded with the run seed and
//! switched to stream `i`, so every draw can be rebuilt on its own, in any
//! order and on any thread, and comes out identical.
//!
//! When no seed is supplied one is taken from the thread RNG at construction.
//! The resampler then still restarts identically within its own lifetime, but
//! separate runs are not reproducible.

use log::debug;
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogStore, Hypocenter};

/// Location-error distribution, parameterised by each event's 1σ uncertainties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyModel {
    /// Independent N(0, σh) on x and y, N(0, σv) on z.
    #[default]
    Gaussian,
    /// Independent U(-σh, σh) on x and y, U(-σv, σv) on z.
    Uniform,
    /// Catalog locations are used as they are.
    Fixed,
}

impl UncertaintyModel {
    fn offset(&self, rng: &mut ChaCha8Rng, sigma: f64) -> f64 {
        match self {
            Self::Gaussian => {
                let z: f64 = rng.sample(StandardNormal);
                sigma * z
            }
            Self::Uniform => sigma * (2.0 * rng.gen::<f64>() - 1.0),
            Self::Fixed => 0.0,
        }
    }

    fn perturb(&self, rng: &mut ChaCha8Rng, hypo: &Hypocenter) -> Vector3<f64> {
        let dx = self.offset(rng, hypo.horizontal_uncertainty);
        let dy = self.offset(rng, hypo.horizontal_uncertainty);
        let dz = self.offset(rng, hypo.vertical_uncertainty);
        hypo.position + Vector3::new(dx, dy, dz)
    }
}

/// One perturbed copy of the whole catalog, positions in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResampledDraw {
    pub index: usize,
    positions: Vec<Vector3<f64>>,
}

impl ResampledDraw {
    pub fn position(&self, catalog_idx: usize) -> &Vector3<f64> {
        &self.positions[catalog_idx]
    }

    pub fn positions(&self) -> &[Vector3<f64>] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Resampler<'a> {
    catalog: &'a CatalogStore,
    n_mc: usize,
    model: UncertaintyModel,
    seed: u64,
}

impl<'a> Resampler<'a> {
    pub fn new(
        catalog: &'a CatalogStore,
        n_mc: usize,
        model: UncertaintyModel,
        seed: Option<u64>,
    ) -> Self {
        let seed = seed.unwrap_or_else(|| {
            let drawn: u64 = rand::thread_rng().gen();
            debug!("no Monte Carlo seed given, drew {drawn}");
            drawn
        });

        Self {
            catalog,
            n_mc,
            model,
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn n_mc(&self) -> usize {
        self.n_mc
    }

    pub fn model(&self) -> UncertaintyModel {
        self.model
    }

    pub fn catalog(&self) -> &'a CatalogStore {
        self.catalog
    }

    /// Builds draw `index`. Any index is valid; [`Resampler::draws`] stops at `n_mc`.
    pub fn draw(&self, index: usize) -> ResampledDraw {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index as u64);

        let positions = self
            .catalog
            .hypocenters()
            .iter()
            .map(|hypo| self.model.perturb(&mut rng, hypo))
            .collect();

        ResampledDraw { index, positions }
    }

    /// Lazy sequence of the `n_mc` draws; each call starts again at draw 0.
    pub fn draws(&self) -> DrawIter<'_, 'a> {
        DrawIter {
            resampler: self,
            next: 0,
        }
    }
}

pub struct DrawIter<'r, 'a> {
    resampler: &'r Resampler<'a>,
    next: usize,
}

impl Iterator for DrawIter<'_, '_> {
    type Item = ResampledDraw;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.resampler.n_mc {
            return None;
        }
        let draw = self.resampler.draw(self.next);
        self.next += 1;
        Some(draw)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.resampler.n_mc.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for DrawIter<'_, '_> {}
