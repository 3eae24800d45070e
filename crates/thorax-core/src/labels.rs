//! Uncertain-label resolution for CheXpert-style annotations.
//!
//! Raw manifest cells carry one of four markers per diagnostic class: empty
//! (unmentioned), `0` (negative), `1` (positive) or `-1` (uncertain). The
//! uncertain marker must be collapsed to a definite binary target before
//! training, and the mapping is a per-class decision. The policy is an
//! explicit table keyed by class name and validated against the declared
//! class list, so a reordering of the classes cannot silently change which
//! classes resolve uncertain to positive.

use crate::error::{Result, ThoraxError};

/// The fourteen CheXpert observation classes, in manifest column order.
pub const CLASS_NAMES: [&str; 14] = [
    "No Finding",
    "Enlarged Cardiomediastinum",
    "Cardiomegaly",
    "Lung Opacity",
    "Lung Lesion",
    "Edema",
    "Consolidation",
    "Pneumonia",
    "Atelectasis",
    "Pneumothorax",
    "Pleural Effusion",
    "Pleural Other",
    "Fracture",
    "Support Devices",
];

/// How an uncertain (`-1`) annotation resolves for a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertainPolicy {
    /// Treat uncertain as positive (U-Ones).
    AssignOne,
    /// Treat uncertain as negative (U-Zeros).
    AssignZero,
}

/// Resolve a single raw label cell to a binary target.
///
/// Empty or non-numeric cells and any numeric value other than `1` and `-1`
/// resolve to 0. The output is always exactly `0.0` or `1.0`.
pub fn resolve_cell(raw: &str, policy: UncertainPolicy) -> f32 {
    let Ok(value) = raw.trim().parse::<f32>() else {
        return 0.0;
    };
    if value == 1.0 {
        1.0
    } else if value == -1.0 {
        match policy {
            UncertainPolicy::AssignOne => 1.0,
            UncertainPolicy::AssignZero => 0.0,
        }
    } else {
        0.0
    }
}

/// Per-class label semantics: the declared class list plus one uncertainty
/// policy per class. Applied identically across train, validation and test
/// splits.
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    classes: Vec<String>,
    policies: Vec<UncertainPolicy>,
}

impl LabelPolicy {
    /// Build a policy from the declared class list and a table of per-class
    /// overrides. Classes absent from the table default to
    /// [`UncertainPolicy::AssignZero`]; a table entry naming an undeclared
    /// class is rejected.
    pub fn from_table(
        classes: &[&str],
        table: &[(&str, UncertainPolicy)],
    ) -> Result<Self> {
        if classes.is_empty() {
            return Err(ThoraxError::PolicyTable("class list is empty".into()));
        }
        for (name, _) in table {
            if !classes.contains(name) {
                return Err(ThoraxError::PolicyTable(format!(
                    "unknown class {name:?}"
                )));
            }
        }

        let policies = classes
            .iter()
            .map(|class| {
                table
                    .iter()
                    .find(|entry| entry.0 == *class)
                    .map_or(UncertainPolicy::AssignZero, |entry| entry.1)
            })
            .collect();

        Ok(Self {
            classes: classes.iter().map(|s| (*s).to_string()).collect(),
            policies,
        })
    }

    /// The CheXpert default: uncertain resolves to positive for Pleural
    /// Effusion and Support Devices, to negative everywhere else.
    pub fn chexpert_default() -> Self {
        Self::from_table(
            &CLASS_NAMES,
            &[
                ("Pleural Effusion", UncertainPolicy::AssignOne),
                ("Support Devices", UncertainPolicy::AssignOne),
            ],
        )
        .expect("builtin policy table matches builtin class list")
    }

    /// Declared class names, in manifest column order.
    pub fn class_names(&self) -> &[String] {
        &self.classes
    }

    /// Number of diagnostic classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Policy for the class at `index`.
    pub fn policy(&self, index: usize) -> Option<UncertainPolicy> {
        self.policies.get(index).copied()
    }

    /// Resolve a full row of raw label cells into a binary target vector.
    ///
    /// `cells` must cover at least the declared class count; trailing extra
    /// cells are ignored. The returned vector always has exactly
    /// `class_count()` entries, each `0.0` or `1.0`.
    pub fn resolve_row(&self, cells: &[&str]) -> Result<Vec<f32>> {
        if cells.len() < self.policies.len() {
            return Err(ThoraxError::PolicyTable(format!(
                "label row has {} cells, expected at least {}",
                cells.len(),
                self.policies.len()
            )));
        }
        Ok(self
            .policies
            .iter()
            .zip(cells.iter())
            .map(|(policy, cell)| resolve_cell(cell, *policy))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_output_is_binary() {
        for raw in ["", "0", "1", "-1", "0.0", "1.0", "-1.0", "2", "0.5", "nan?", "abc"] {
            for policy in [UncertainPolicy::AssignOne, UncertainPolicy::AssignZero] {
                let out = resolve_cell(raw, policy);
                assert!(out == 0.0 || out == 1.0, "raw {raw:?} resolved to {out}");
            }
        }
    }

    #[test]
    fn positive_and_blank_cells_ignore_policy() {
        for policy in [UncertainPolicy::AssignOne, UncertainPolicy::AssignZero] {
            assert_eq!(resolve_cell("1", policy), 1.0);
            assert_eq!(resolve_cell("1.0", policy), 1.0);
            assert_eq!(resolve_cell("", policy), 0.0);
            assert_eq!(resolve_cell("not-a-number", policy), 0.0);
            assert_eq!(resolve_cell("0", policy), 0.0);
        }
    }

    #[test]
    fn uncertain_cell_follows_policy() {
        assert_eq!(resolve_cell("-1", UncertainPolicy::AssignOne), 1.0);
        assert_eq!(resolve_cell("-1.0", UncertainPolicy::AssignOne), 1.0);
        assert_eq!(resolve_cell("-1", UncertainPolicy::AssignZero), 0.0);
    }

    #[test]
    fn default_policy_marks_the_two_u_ones_classes() {
        let policy = LabelPolicy::chexpert_default();
        assert_eq!(policy.class_count(), 14);
        for (i, name) in policy.class_names().iter().enumerate() {
            let expected = if name == "Pleural Effusion" || name == "Support Devices" {
                UncertainPolicy::AssignOne
            } else {
                UncertainPolicy::AssignZero
            };
            assert_eq!(policy.policy(i), Some(expected), "class {name}");
        }
        // Original index positions 10 and 13.
        assert_eq!(policy.policy(10), Some(UncertainPolicy::AssignOne));
        assert_eq!(policy.policy(13), Some(UncertainPolicy::AssignOne));
    }

    #[test]
    fn resolve_row_length_matches_class_count() {
        let policy = LabelPolicy::chexpert_default();
        let mut cells = vec!["-1"; 14];
        cells.extend(["9", "extra", ""]); // trailing junk beyond the class span
        let resolved = policy.resolve_row(&cells).unwrap();
        assert_eq!(resolved.len(), 14);
        for (i, value) in resolved.iter().enumerate() {
            let expected = if i == 10 || i == 13 { 1.0 } else { 0.0 };
            assert_eq!(*value, expected, "class index {i}");
        }
    }

    #[test]
    fn short_row_is_rejected() {
        let policy = LabelPolicy::chexpert_default();
        assert!(policy.resolve_row(&["1", "0"]).is_err());
    }

    #[test]
    fn unknown_class_in_table_is_rejected() {
        let err = LabelPolicy::from_table(
            &CLASS_NAMES,
            &[("Emphysema", UncertainPolicy::AssignOne)],
        );
        assert!(err.is_err());
    }
}
