//! Character alphabets and tip-state encoding.
//!
//! Maps alignment characters to per-state indicator vectors: an observed
//! state sets a single 1, an IUPAC ambiguity code sets every compatible
//! state, gaps and unknowns set every state.

/// Number of nucleotide states.
pub const DNA_STATES: usize = 4;

/// Number of amino acid states.
pub const AA_STATES: usize = 20;

/// Sequence alphabet, selected from the substitution model's state count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Alphabet {
    /// A C G T (U read as T).
    Dna,
    /// A R N D C Q E G H I L K M F P S T W Y V.
    Protein,
}

impl Alphabet {
    /// Alphabet with `n_states` states, if supported.
    pub fn from_state_count(n_states: usize) -> Option<Self> {
        match n_states {
            DNA_STATES => Some(Alphabet::Dna),
            AA_STATES => Some(Alphabet::Protein),
            _ => None,
        }
    }

    /// Number of states.
    pub fn n_states(self) -> usize {
        match self {
            Alphabet::Dna => DNA_STATES,
            Alphabet::Protein => AA_STATES,
        }
    }

    /// Write the indicator vector of `symbol` into `out` (length `n_states`).
    ///
    /// Unrecognised symbols are treated as missing data.
    pub fn encode_into(self, symbol: u8, out: &mut [f64]) {
        match self {
            Alphabet::Dna => {
                let mask = nucleotide_mask(symbol);
                for (k, slot) in out.iter_mut().enumerate().take(DNA_STATES) {
                    *slot = if mask & (1 << k) != 0 { 1.0 } else { 0.0 };
                }
            }
            Alphabet::Protein => {
                for (k, slot) in out.iter_mut().enumerate().take(AA_STATES) {
                    *slot = if amino_acid_compatible(symbol, k) { 1.0 } else { 0.0 };
                }
            }
        }
    }
}

/// Map a nucleotide byte to an index (A=0, C=1, G=2, T=3).
///
/// Accepts both upper and lower case. Returns `None` for non-standard bases.
pub fn nucleotide_index(b: u8) -> Option<usize> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// Bitmask of nucleotide states compatible with an IUPAC code
/// (bit 0 = A, bit 1 = C, bit 2 = G, bit 3 = T).
///
/// Gaps, `N`, `?` and anything unrecognised map to all four states.
pub fn nucleotide_mask(b: u8) -> u8 {
    const A: u8 = 1;
    const C: u8 = 2;
    const G: u8 = 4;
    const T: u8 = 8;
    match b.to_ascii_uppercase() {
        b'A' => A,
        b'C' => C,
        b'G' => G,
        b'T' | b'U' => T,
        b'R' => A | G,
        b'Y' => C | T,
        b'S' => C | G,
        b'W' => A | T,
        b'K' => G | T,
        b'M' => A | C,
        b'B' => C | G | T,
        b'D' => A | G | T,
        b'H' => A | C | T,
        b'V' => A | C | G,
        _ => A | C | G | T,
    }
}

/// Map an amino acid byte to its index (0-19).
///
/// Uses the standard phylogenetics ordering: A=0, R=1, N=2, D=3, C=4,
/// Q=5, E=6, G=7, H=8, I=9, L=10, K=11, M=12, F=13, P=14, S=15,
/// T=16, W=17, Y=18, V=19.
pub fn amino_acid_index(aa: u8) -> Option<usize> {
    match aa.to_ascii_uppercase() {
        b'A' => Some(0),
        b'R' => Some(1),
        b'N' => Some(2),
        b'D' => Some(3),
        b'C' => Some(4),
        b'Q' => Some(5),
        b'E' => Some(6),
        b'G' => Some(7),
        b'H' => Some(8),
        b'I' => Some(9),
        b'L' => Some(10),
        b'K' => Some(11),
        b'M' => Some(12),
        b'F' => Some(13),
        b'P' => Some(14),
        b'S' => Some(15),
        b'T' => Some(16),
        b'W' => Some(17),
        b'Y' => Some(18),
        b'V' => Some(19),
        _ => None,
    }
}

/// Whether amino acid state `k` is compatible with `symbol`.
///
/// B = D|N, Z = E|Q, J = I|L; anything else unrecognised is missing data.
fn amino_acid_compatible(symbol: u8, k: usize) -> bool {
    match amino_acid_index(symbol) {
        Some(i) => i == k,
        None => match symbol.to_ascii_uppercase() {
            b'B' => k == 2 || k == 3,
            b'Z' => k == 5 || k == 6,
            b'J' => k == 9 || k == 10,
            _ => true,
        },
    }
}

/// JC69 transition probability matrix for a given branch length `t`.
///
/// - P(same) = 1/4 + 3/4 * e^{-4t/3}
/// - P(diff) = 1/4 - 1/4 * e^{-4t/3}
pub fn jc69_probability(t: f64) -> [[f64; 4]; 4] {
    let e = (-4.0 * t / 3.0).exp();
    let p_same = 0.25 + 0.75 * e;
    let p_diff = 0.25 - 0.25 * e;

    [
        [p_same, p_diff, p_diff, p_diff],
        [p_diff, p_same, p_diff, p_diff],
        [p_diff, p_diff, p_same, p_diff],
        [p_diff, p_diff, p_diff, p_same],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(alphabet: Alphabet, symbol: u8) -> Vec<f64> {
        let mut out = vec![-1.0; alphabet.n_states()];
        alphabet.encode_into(symbol, &mut out);
        out
    }

    #[test]
    fn nucleotide_index_standard() {
        assert_eq!(nucleotide_index(b'A'), Some(0));
        assert_eq!(nucleotide_index(b'c'), Some(1));
        assert_eq!(nucleotide_index(b'G'), Some(2));
        assert_eq!(nucleotide_index(b'u'), Some(3));
        assert_eq!(nucleotide_index(b'N'), None);
    }

    #[test]
    fn dna_observed_and_ambiguous() {
        assert_eq!(encode(Alphabet::Dna, b'G'), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(encode(Alphabet::Dna, b'r'), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(encode(Alphabet::Dna, b'Y'), vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(encode(Alphabet::Dna, b'B'), vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn dna_gaps_are_missing() {
        for &c in b"-N?." {
            assert_eq!(encode(Alphabet::Dna, c), vec![1.0; 4]);
        }
    }

    #[test]
    fn every_iupac_code_matches_its_bases() {
        for &(code, bases) in &[
            (b'M', "AC"),
            (b'K', "GT"),
            (b'S', "CG"),
            (b'W', "AT"),
            (b'D', "AGT"),
            (b'H', "ACT"),
            (b'V', "ACG"),
        ] {
            let mask = nucleotide_mask(code);
            let expected = bases
                .bytes()
                .map(|b| 1u8 << nucleotide_index(b).unwrap())
                .fold(0, |acc, bit| acc | bit);
            assert_eq!(mask, expected, "code {}", code as char);
        }
    }

    #[test]
    fn protein_encoding() {
        let w = encode(Alphabet::Protein, b'W');
        assert_eq!(w.iter().sum::<f64>(), 1.0);
        assert_eq!(w[17], 1.0);
        let b = encode(Alphabet::Protein, b'B');
        assert_eq!(b.iter().sum::<f64>(), 2.0);
        assert_eq!(b[2], 1.0);
        assert_eq!(b[3], 1.0);
        assert_eq!(encode(Alphabet::Protein, b'X'), vec![1.0; 20]);
        assert_eq!(encode(Alphabet::Protein, b'-'), vec![1.0; 20]);
    }

    #[test]
    fn alphabet_from_states() {
        assert_eq!(Alphabet::from_state_count(4), Some(Alphabet::Dna));
        assert_eq!(Alphabet::from_state_count(20), Some(Alphabet::Protein));
        assert_eq!(Alphabet::from_state_count(61), None);
    }

    #[test]
    fn jc69_rows_sum_to_one() {
        for &t in &[0.0, 0.01, 0.5, 5.0] {
            let p = jc69_probability(t);
            for row in &p {
                assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            }
        }
        let p = jc69_probability(0.0);
        assert_eq!(p[1][1], 1.0);
        assert_eq!(p[1][2], 0.0);
    }
}
