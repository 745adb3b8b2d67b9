//! Named, equal-length sequences and their tip partials.

use sts_core::{Result, StsError, Summarizable};

use crate::models::Alphabet;

/// A multiple sequence alignment.
///
/// Row order is preserved; the likelihood engine assigns leaf buffers by row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Alignment {
    names: Vec<String>,
    sequences: Vec<Vec<u8>>,
}

impl Alignment {
    /// Build from `(name, sequence)` rows of equal length.
    ///
    /// Duplicate names are accepted here and rejected by the engine.
    pub fn new(rows: Vec<(String, Vec<u8>)>) -> Result<Self> {
        if rows.is_empty() {
            return Err(StsError::InvalidInput("empty alignment".into()));
        }
        let n_sites = rows[0].1.len();
        if n_sites == 0 {
            return Err(StsError::InvalidInput("alignment has no sites".into()));
        }
        if let Some((name, seq)) = rows.iter().find(|(_, s)| s.len() != n_sites) {
            return Err(StsError::InvalidInput(format!(
                "sequence {} has {} sites, expected {}",
                name,
                seq.len(),
                n_sites
            )));
        }
        let (names, sequences) = rows.into_iter().unzip();
        Ok(Self { names, sequences })
    }

    /// Convenience constructor from string slices.
    pub fn from_pairs(rows: &[(&str, &str)]) -> Result<Self> {
        Self::new(
            rows.iter()
                .map(|(n, s)| (n.to_string(), s.as_bytes().to_vec()))
                .collect(),
        )
    }

    /// Number of sequences.
    pub fn n_sequences(&self) -> usize {
        self.names.len()
    }

    /// Alignment length.
    pub fn n_sites(&self) -> usize {
        self.sequences[0].len()
    }

    /// Sequence names in row order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Sequence by row.
    pub fn sequence_at(&self, row: usize) -> Option<&[u8]> {
        self.sequences.get(row).map(Vec::as_slice)
    }

    /// Sequence by name (first match).
    pub fn sequence(&self, name: &str) -> Option<&[u8]> {
        let row = self.names.iter().position(|n| n == name)?;
        self.sequence_at(row)
    }

    /// Tip partials of row `row`, laid out `[rate][site][state]` with the
    /// per-site indicator vector replicated across `n_rates` categories.
    pub fn tip_partials(&self, row: usize, alphabet: Alphabet, n_rates: usize) -> Result<Vec<f64>> {
        let seq = self.sequence_at(row).ok_or_else(|| {
            StsError::InvalidInput(format!(
                "row {} out of range ({} sequences)",
                row,
                self.n_sequences()
            ))
        })?;
        let n_states = alphabet.n_states();
        let block = seq.len() * n_states;
        let mut partials = vec![0.0; n_rates * block];
        for (site, &symbol) in seq.iter().enumerate() {
            let off = site * n_states;
            alphabet.encode_into(symbol, &mut partials[off..off + n_states]);
        }
        for r in 1..n_rates {
            partials.copy_within(0..block, r * block);
        }
        Ok(partials)
    }
}

impl Summarizable for Alignment {
    fn summary(&self) -> String {
        format!(
            "Alignment: {} sequences x {} sites",
            self.n_sequences(),
            self.n_sites()
        )
    }
}
