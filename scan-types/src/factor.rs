use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Categorical labelling of a set of items (cells or genes). Each item carries a code that
/// indexes into `levels`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Factor {
    levels: Vec<String>,
    codes: Vec<u32>,
}

impl Factor {
    /// Build a factor from explicit levels and codes.
    pub fn new(levels: Vec<String>, codes: Vec<u32>) -> Result<Factor, Error> {
        if let Some(&bad) = codes.iter().find(|&&c| c as usize >= levels.len()) {
            bail!("factor code {} out of range for {} levels", bad, levels.len());
        }
        Ok(Factor { levels, codes })
    }

    /// Build a factor from string labels. Levels are ordered by first appearance.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Factor {
        let mut levels: Vec<String> = Vec::new();
        let mut lookup: HashMap<String, u32> = HashMap::new();
        let codes = labels
            .iter()
            .map(|l| {
                let l = l.as_ref();
                if let Some(&code) = lookup.get(l) {
                    code
                } else {
                    let code = levels.len() as u32;
                    levels.push(l.to_string());
                    lookup.insert(l.to_string(), code);
                    code
                }
            })
            .collect();
        Factor { levels, codes }
    }

    /// Build a factor from zero-based integer codes. Level `i` is named `i + 1`, matching the
    /// one-based cluster names shown in reports.
    pub fn from_codes(codes: &[usize]) -> Factor {
        let n_levels = codes.iter().max().map_or(0, |&m| m + 1);
        Factor {
            levels: (1..=n_levels).map(|i| i.to_string()).collect(),
            codes: codes.iter().map(|&c| c as u32).collect(),
        }
    }

    /// Number of labelled items
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// True if no items are labelled
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Number of levels, including levels with no members
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level names
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Per-item level codes
    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    /// Level code of item `i`
    pub fn code(&self, i: usize) -> usize {
        self.codes[i] as usize
    }

    /// Level name of item `i`
    pub fn label(&self, i: usize) -> &str {
        &self.levels[self.codes[i] as usize]
    }

    /// Position of a level name
    pub fn level_index(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    /// Item indices grouped by level, one (possibly empty) vector per level.
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.levels.len()];
        for (i, &c) in self.codes.iter().enumerate() {
            groups[c as usize].push(i);
        }
        groups
    }

    /// Item indices of a single level, or None if the level doesn't exist.
    pub fn indices_of(&self, level: &str) -> Option<Vec<usize>> {
        let code = self.level_index(level)? as u32;
        Some(
            self.codes
                .iter()
                .enumerate()
                .filter(|(_, &c)| c == code)
                .map(|(i, _)| i)
                .collect(),
        )
    }

    /// Number of items in each level
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels.len()];
        for &c in &self.codes {
            counts[c as usize] += 1;
        }
        counts
    }

    /// Restrict to the items at `idx`, keeping all levels.
    pub fn subset(&self, idx: &[usize]) -> Factor {
        Factor {
            levels: self.levels.clone(),
            codes: idx.iter().map(|&i| self.codes[i]).collect(),
        }
    }

    /// Remove levels with no members, preserving the order of the remaining ones.
    pub fn drop_unused_levels(self) -> Factor {
        let counts = self.counts();
        let mut remap = vec![u32::MAX; self.levels.len()];
        let mut levels = Vec::new();
        for (old, level) in self.levels.into_iter().enumerate() {
            if counts[old] > 0 {
                remap[old] = levels.len() as u32;
                levels.push(level);
            }
        }
        let codes = self.codes.iter().map(|&c| remap[c as usize]).collect();
        Factor { levels, codes }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_labels_first_appearance() {
        let f = Factor::from_labels(&["b", "a", "b", "c", "a"]);
        assert_eq!(f.levels(), &["b", "a", "c"]);
        assert_eq!(f.codes(), &[0, 1, 0, 2, 1]);
        assert_eq!(f.groups(), vec![vec![0, 2], vec![1, 4], vec![3]]);
        assert_eq!(f.indices_of("a"), Some(vec![1, 4]));
        assert_eq!(f.indices_of("z"), None);
        assert_eq!(f.counts(), vec![2, 2, 1]);
    }

    #[test]
    fn test_from_codes_names() {
        let f = Factor::from_codes(&[2, 0, 0, 1]);
        assert_eq!(f.levels(), &["1", "2", "3"]);
        assert_eq!(f.label(0), "3");
    }

    #[test]
    fn test_subset_and_drop() {
        let f = Factor::from_labels(&["x", "y", "z", "y"]);
        let s = f.subset(&[1, 3]);
        assert_eq!(s.n_levels(), 3);
        let s = s.drop_unused_levels();
        assert_eq!(s.levels(), &["y"]);
        assert_eq!(s.codes(), &[0, 0]);
    }

    #[test]
    fn test_bad_codes() {
        assert!(Factor::new(vec!["a".to_string()], vec![0, 1]).is_err());
    }
}
