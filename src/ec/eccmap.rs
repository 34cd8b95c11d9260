//! ECC Maps
//!
//! Static incidence tables for the XOR erasure code. For each named scheme,
//! parity fragment `j` is the bytewise XOR of the data fragments listed in
//! row `j` of its table. Missing data is recovered by peeling: a parity whose
//! inputs are all present except one yields that one directly, and recovered
//! fragments may unlock further parities.

use crate::error::{Error, Result};

/// Static description of a supported scheme.
#[derive(Debug, Clone, Copy)]
struct SchemeSpec {
    name: &'static str,
    suppliers: usize,
    parity_to_data: &'static [&'static [usize]],
    correctable_missing: usize,
    fire_hire_errors: usize,
}

const SCHEMES: &[SchemeSpec] = &[
    SchemeSpec {
        name: "2x2",
        suppliers: 2,
        parity_to_data: PARITY_TO_DATA_2X2,
        correctable_missing: 1,
        fire_hire_errors: 1,
    },
    SchemeSpec {
        name: "4x4",
        suppliers: 4,
        parity_to_data: PARITY_TO_DATA_4X4,
        correctable_missing: 2,
        fire_hire_errors: 1,
    },
    SchemeSpec {
        name: "7x7",
        suppliers: 7,
        parity_to_data: PARITY_TO_DATA_7X7,
        correctable_missing: 3,
        fire_hire_errors: 2,
    },
    SchemeSpec {
        name: "13x13",
        suppliers: 13,
        parity_to_data: PARITY_TO_DATA_13X13,
        correctable_missing: 4,
        fire_hire_errors: 2,
    },
    SchemeSpec {
        name: "18x18",
        suppliers: 18,
        parity_to_data: PARITY_TO_DATA_18X18,
        correctable_missing: 5,
        fire_hire_errors: 2,
    },
    SchemeSpec {
        name: "26x26",
        suppliers: 26,
        parity_to_data: PARITY_TO_DATA_26X26,
        correctable_missing: 6,
        fire_hire_errors: 3,
    },
    SchemeSpec {
        name: "64x64",
        suppliers: 64,
        parity_to_data: PARITY_TO_DATA_64X64,
        correctable_missing: 10,
        fire_hire_errors: 5,
    },
];

/// Prefix accepted in front of scheme names, e.g. `ecc/18x18`.
const NAME_PREFIX: &str = "ecc/";

/// Scheme used when none is configured.
pub const DEFAULT_SCHEME: &str = "18x18";

// =============================================================================
// Recovery Plan
// =============================================================================

/// One peeling step: recover `data_index` from `parity_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStep {
    pub data_index: usize,
    pub parity_index: usize,
}

/// Ordered recovery derived from a presence pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Steps in the order they must be applied
    pub steps: Vec<RecoveryStep>,

    /// Parities whose inputs are all present after the steps
    pub rebuilt_parity: Vec<usize>,

    /// Data presence after applying the steps
    pub data: Vec<bool>,

    /// Parity presence after rebuilding `rebuilt_parity`
    pub parity: Vec<bool>,
}

impl RecoveryPlan {
    /// True when every data fragment is present after the plan.
    pub fn is_complete(&self) -> bool {
        self.data.iter().all(|d| *d)
    }

    /// Number of data fragments still missing after the plan.
    pub fn missing_data(&self) -> usize {
        self.data.iter().filter(|d| !**d).count()
    }

    /// True when the plan recovers or rebuilds nothing.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && self.rebuilt_parity.is_empty()
    }
}

// =============================================================================
// ECC Map
// =============================================================================

/// A named XOR code with `k` data and `m` parity fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccMap {
    name: &'static str,
    data_count: usize,
    parity_to_data: &'static [&'static [usize]],
    data_to_parity: Vec<Vec<usize>>,
    correctable_missing: usize,
    fire_hire_errors: usize,
}

impl EccMap {
    /// Look up a scheme by name (`18x18` or `ecc/18x18`).
    pub fn by_name(name: &str) -> Result<Self> {
        let short = name.strip_prefix(NAME_PREFIX).unwrap_or(name);
        SCHEMES
            .iter()
            .find(|s| s.name == short)
            .map(Self::from_spec)
            .ok_or_else(|| Error::UnknownEccScheme(name.to_string()))
    }

    /// Scheme used for a given number of suppliers.
    pub fn for_supplier_count(suppliers: usize) -> Result<Self> {
        SCHEMES
            .iter()
            .find(|s| s.suppliers == suppliers)
            .map(Self::from_spec)
            .ok_or_else(|| {
                Error::UnknownEccScheme(format!("no scheme for {} suppliers", suppliers))
            })
    }

    /// All supported scheme names.
    pub fn names() -> Vec<&'static str> {
        SCHEMES.iter().map(|s| s.name).collect()
    }

    /// All supported supplier counts, ascending.
    pub fn supplier_counts() -> Vec<usize> {
        SCHEMES.iter().map(|s| s.suppliers).collect()
    }

    fn from_spec(spec: &SchemeSpec) -> Self {
        let data_count = spec
            .parity_to_data
            .iter()
            .flat_map(|row| row.iter())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        let mut data_to_parity = vec![Vec::new(); data_count];
        for (parity, row) in spec.parity_to_data.iter().enumerate() {
            for &data in row.iter() {
                data_to_parity[data].push(parity);
            }
        }

        Self {
            name: spec.name,
            data_count,
            parity_to_data: spec.parity_to_data,
            data_to_parity,
            correctable_missing: spec.correctable_missing,
            fire_hire_errors: spec.fire_hire_errors,
        }
    }

    /// Scheme name without prefix.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of data fragments (k).
    pub fn data_count(&self) -> usize {
        self.data_count
    }

    /// Number of parity fragments (m).
    pub fn parity_count(&self) -> usize {
        self.parity_to_data.len()
    }

    /// Total fragments per block (k + m).
    pub fn total_count(&self) -> usize {
        self.data_count + self.parity_count()
    }

    /// Supplier positions per backup. Position `i` holds `Data i` and `Parity i`.
    pub fn supplier_count(&self) -> usize {
        self.data_count.max(self.parity_count())
    }

    /// Maximum simultaneously missing fragments guaranteed recoverable.
    pub fn correctable_missing(&self) -> usize {
        self.correctable_missing
    }

    /// Failed suppliers tolerated before suppliers should be replaced.
    pub fn fire_hire_errors(&self) -> usize {
        self.fire_hire_errors
    }

    /// Data fragments that must survive when the worst case is hit.
    pub fn data_needed(&self) -> usize {
        self.data_count - self.correctable_missing
    }

    /// Data indices XOR-ed into parity `j`.
    pub fn datas_for_parity(&self, parity: usize) -> &[usize] {
        self.parity_to_data.get(parity).copied().unwrap_or(&[])
    }

    /// Parity indices that include data `i`.
    pub fn parities_for_data(&self, data: usize) -> &[usize] {
        self.data_to_parity
            .get(data)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Smallest present parity that can recover data `index` in one step.
    ///
    /// Returns `None` when `index` is already present or no parity has it as
    /// its single missing input.
    pub fn data_fix_path(&self, data: &[bool], parity: &[bool], index: usize) -> Option<usize> {
        if present(data, index) {
            return None;
        }

        let mut best: Option<usize> = None;
        for &p in self.parities_for_data(index) {
            if !present(parity, p) {
                continue;
            }
            let row = self.datas_for_parity(p);
            let missing = row.iter().filter(|&&d| !present(data, d)).count();
            if missing != 1 {
                continue;
            }
            match best {
                Some(b) if self.datas_for_parity(b).len() <= row.len() => {}
                _ => best = Some(p),
            }
        }
        best
    }

    /// Whether some data can be peeled or some parity rebuilt.
    pub fn can_make_progress(&self, data: &[bool], parity: &[bool]) -> bool {
        (0..self.parity_count()).any(|p| {
            let missing = self
                .datas_for_parity(p)
                .iter()
                .filter(|&&d| !present(data, d))
                .count();
            if present(parity, p) {
                missing == 1
            } else {
                missing == 0
            }
        })
    }

    /// Whether all data fragments can be recovered from what is present.
    pub fn is_fixable(&self, data: &[bool], parity: &[bool]) -> bool {
        self.plan_recovery(data, parity).is_complete()
    }

    /// Build the peeling schedule for a presence pattern.
    ///
    /// Data is peeled in index order until a full pass makes no progress,
    /// then every missing parity whose inputs are all present is rebuilt.
    pub fn plan_recovery(&self, data: &[bool], parity: &[bool]) -> RecoveryPlan {
        let mut data: Vec<bool> = (0..self.data_count).map(|i| present(data, i)).collect();
        let mut parity: Vec<bool> = (0..self.parity_count())
            .map(|j| present(parity, j))
            .collect();
        let mut steps = Vec::new();

        let mut progress = true;
        while progress {
            progress = false;
            for i in 0..self.data_count {
                if data[i] {
                    continue;
                }
                if let Some(p) = self.data_fix_path(&data, &parity, i) {
                    steps.push(RecoveryStep {
                        data_index: i,
                        parity_index: p,
                    });
                    data[i] = true;
                    progress = true;
                }
            }
        }

        let mut rebuilt_parity = Vec::new();
        for (j, have) in parity.iter_mut().enumerate() {
            if !*have && self.datas_for_parity(j).iter().all(|&d| data[d]) {
                *have = true;
                rebuilt_parity.push(j);
            }
        }

        RecoveryPlan {
            steps,
            rebuilt_parity,
            data,
            parity,
        }
    }
}

impl Default for EccMap {
    /// The `18x18` scheme.
    fn default() -> Self {
        let spec = SCHEMES
            .iter()
            .find(|s| s.name == DEFAULT_SCHEME)
            .unwrap_or(&SCHEMES[0]);
        Self::from_spec(spec)
    }
}

impl std::fmt::Display for EccMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", NAME_PREFIX, self.name)
    }
}

fn present(bits: &[bool], index: usize) -> bool {
    bits.get(index).copied().unwrap_or(false)
}

// =============================================================================
// Tables
// =============================================================================

const PARITY_TO_DATA_2X2: &[&[usize]] = &[
    &[1],
    &[0],
];

const PARITY_TO_DATA_4X4: &[&[usize]] = &[
    &[1, 2, 3],
    &[0, 2],
    &[0, 3],
    &[0, 1],
];

const PARITY_TO_DATA_7X7: &[&[usize]] = &[
    &[3, 4, 6],
    &[0, 4, 5],
    &[1, 5, 6],
    &[0, 2, 6],
    &[0, 1, 3],
    &[1, 2, 4],
    &[2, 3, 5],
];

const PARITY_TO_DATA_13X13: &[&[usize]] = &[
    &[1, 4, 8, 12],
    &[5, 8, 9, 11],
    &[3, 7, 10, 11],
    &[0, 4, 6, 9],
    &[2, 3, 6, 12],
    &[0, 1, 6, 10],
    &[1, 3, 7, 9],
    &[2, 5, 8, 12],
    &[2, 4, 7, 11],
    &[0, 1, 3, 5, 12],
    &[6, 7, 8],
    &[2, 5, 9, 10],
    &[0, 4, 10, 11],
];

const PARITY_TO_DATA_18X18: &[&[usize]] = &[
    &[5, 7, 11, 16, 17],
    &[2, 9, 11, 13, 17],
    &[5, 8, 9, 13, 15],
    &[0, 1, 4, 6, 10],
    &[2, 3, 12, 13, 14],
    &[6, 8, 13, 17],
    &[2, 5, 10, 12],
    &[3, 10, 11, 14],
    &[0, 1, 3, 4, 5, 6, 7, 9, 10, 11, 13, 14, 15, 16, 17],
    &[0, 1, 12, 14],
    &[5, 6, 8, 14, 16],
    &[0, 4, 7, 9],
    &[2, 4, 7, 8],
    &[3, 4, 6, 11, 15],
    &[0, 10, 15, 16],
    &[1, 2, 17],
    &[3, 8, 12, 15],
    &[1, 7, 9, 12, 16],
];

const PARITY_TO_DATA_26X26: &[&[usize]] = &[
    &[1, 8, 11, 16, 19, 21],
    &[3, 6, 8, 17, 23],
    &[6, 7, 11, 17, 21, 25],
    &[0, 10, 13, 14, 21],
    &[5, 9, 10, 18, 22],
    &[12, 13, 17, 20, 21, 22],
    &[1, 2, 9, 13],
    &[2, 3, 5, 9, 20, 22],
    &[0, 6, 9, 12, 15, 25],
    &[2, 7, 14, 15, 16, 24],
    &[2, 5, 6, 11, 15, 16, 18, 19, 23],
    &[2, 10, 12, 13, 14, 20, 23],
    &[0, 3, 4, 11, 19],
    &[0, 1, 4, 18, 19, 20, 23, 25],
    &[1, 5, 7, 11, 20, 21, 25],
    &[1, 4, 16, 17, 18],
    &[2, 4, 11, 22, 24],
    &[5, 12, 13, 14, 16, 24],
    &[3, 7, 10, 20, 22, 24, 25],
    &[0, 8, 10, 12, 17],
    &[0, 8, 9, 17, 19, 22, 25],
    &[4, 5, 15, 16, 22],
    &[6, 8, 12, 14, 15, 18, 23],
    &[1, 3, 7, 13, 19, 24],
    &[0, 3, 4, 7, 14, 15, 21, 23],
    &[6, 8, 9, 10, 18, 24],
];

const PARITY_TO_DATA_64X64: &[&[usize]] = &[
    &[5, 17, 18, 31, 39, 47, 55, 58],
    &[0, 3, 4, 25, 27, 32, 34, 48, 53, 56, 63],
    &[10, 11, 17, 18, 25, 32, 36, 40, 45, 51],
    &[1, 21, 23, 27, 30, 35, 43, 47, 62],
    &[2, 19, 20, 21, 28, 29, 37, 38, 40, 55, 56, 62],
    &[15, 17, 19, 20, 31, 45, 46, 54, 57, 63],
    &[19, 20, 30, 36, 46, 47, 52, 62],
    &[2, 5, 16, 18, 19, 37, 48, 55],
    &[1, 2, 7, 12, 13, 20, 26, 28, 48, 55],
    &[0, 1, 15, 21, 24, 33, 36, 41, 56, 62],
    &[19, 20, 28, 30, 43, 45, 52, 57, 59],
    &[2, 6, 12, 20, 34, 58, 61, 63],
    &[5, 6, 13, 15, 25, 34, 36, 40, 42, 43, 50, 51, 55, 61, 62],
    &[21, 22, 23, 34, 39, 41, 43, 45, 49, 52, 53, 58],
    &[0, 12, 17, 19, 28, 57, 58, 63],
    &[8, 18, 25, 29, 34, 49, 52, 53, 56, 62],
    &[3, 6, 19, 23, 35, 39, 40, 43, 49, 54, 57],
    &[2, 3, 8, 9, 30, 31, 47, 54, 58, 62],
    &[0, 8, 14, 24, 28, 33, 36, 47, 52, 58],
    &[8, 10, 13, 22, 25, 27, 32, 35, 40, 51, 56],
    &[2, 14, 16, 17, 26, 27, 29, 31, 43, 46, 54, 56],
    &[22, 25, 37, 41, 45, 52, 61],
    &[5, 9, 13, 32, 46, 50, 54, 62],
    &[0, 4, 5, 10, 15, 16, 26, 36, 37, 48, 50],
    &[13, 14, 20, 21, 40, 42, 55, 60],
    &[1, 2, 13, 15, 16, 19, 26, 30, 37, 42, 48, 50, 59],
    &[4, 10, 11, 18, 28, 30, 44, 45, 46, 60, 63],
    &[2, 6, 16, 22, 24, 38, 41, 53, 59],
    &[6, 15, 21, 23, 26, 29, 32, 34, 35, 36, 38, 43, 51, 54, 60],
    &[13, 24, 32, 33, 34, 41, 46, 52, 58, 61],
    &[1, 10, 23, 24, 27, 29, 40, 41, 61],
    &[4, 5, 6, 10, 14, 42, 44, 48, 51, 53, 61],
    &[0, 5, 7, 15, 49, 50],
    &[8, 29, 35, 36, 43, 47, 51, 60, 62],
    &[7, 12, 15, 21, 22, 27, 31, 33, 57, 60],
    &[5, 16, 18, 24, 26, 33, 38, 44, 46, 53, 56, 57, 61],
    &[1, 3, 4, 9, 24, 27, 31, 39, 50, 51, 54, 58],
    &[12, 18, 22, 23, 27, 35, 36, 44, 60, 63],
    &[0, 12, 17, 20, 32, 35, 37, 50, 53, 59],
    &[8, 11, 14, 16, 22, 24, 35, 36, 41, 42, 44, 46, 57],
    &[14, 23, 30, 33, 34, 38, 42, 44, 46, 48, 54],
    &[9, 14, 27, 31, 33, 35, 49, 51, 52, 54],
    &[3, 8, 11, 12, 14, 30, 32, 34, 48, 56, 62],
    &[7, 9, 29, 44, 46, 58],
    &[6, 18, 21, 26, 28, 39, 40, 45, 47, 55, 58, 63],
    &[4, 17, 21, 26, 30, 34, 54, 61],
    &[0, 5, 6, 10, 23, 29, 39, 55, 60],
    &[7, 9, 10, 11, 12, 18, 25, 26, 29, 37, 38, 39, 42, 45, 49],
    &[6, 7, 17, 27, 33, 56, 59, 60],
    &[1, 3, 9, 14, 20, 28, 42, 47, 57, 63],
    &[11, 17, 23, 25, 39, 41, 45, 53, 56, 57, 60, 61, 63],
    &[4, 8, 12, 16, 19, 28, 31, 32, 47],
    &[2, 4, 22, 23, 26, 39, 41, 42, 51, 59],
    &[0, 3, 9, 13, 25, 40, 43],
    &[0, 9, 10, 16, 22, 47, 53, 55],
    &[1, 3, 4, 7, 13, 20, 21, 25, 49, 50],
    &[6, 12, 15, 16, 17, 29, 33, 38, 48, 50, 55, 57, 59],
    &[1, 15, 24, 28, 37, 40, 42, 52],
    &[1, 4, 7, 13, 14, 30, 38, 59],
    &[11, 31, 33, 37, 44, 49, 51, 52],
    &[8, 11, 24, 31, 32, 35, 50, 53, 59, 63],
    &[3, 8, 11, 18, 22, 38, 44, 49],
    &[7, 9, 10, 19, 37, 41, 44, 45, 49, 60, 61],
    &[2, 3, 5, 7, 11, 38, 39, 43, 48, 59],
];
