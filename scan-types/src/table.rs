use crate::factor::Factor;
use anyhow::{bail, format_err, Error};
use std::collections::BTreeMap;

/// A single metadata column. All variants hold one entry per row.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// Numeric values
    Num(Vec<f64>),
    /// Flags
    Bool(Vec<bool>),
    /// Free text, missing entries allowed (e.g. unmatched annotation lookups)
    Str(Vec<Option<String>>),
    /// Categorical labels
    Factor(Factor),
}

impl Column {
    /// Number of entries
    pub fn len(&self) -> usize {
        match self {
            Column::Num(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Str(v) => v.len(),
            Column::Factor(f) => f.len(),
        }
    }

    /// True if the column has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries at `idx`, in that order
    pub fn subset(&self, idx: &[usize]) -> Column {
        match self {
            Column::Num(v) => Column::Num(idx.iter().map(|&i| v[i]).collect()),
            Column::Bool(v) => Column::Bool(idx.iter().map(|&i| v[i]).collect()),
            Column::Str(v) => Column::Str(idx.iter().map(|&i| v[i].clone()).collect()),
            Column::Factor(f) => Column::Factor(f.subset(idx)),
        }
    }

    /// Render entry `i` for tabular output. Missing strings render empty.
    pub fn render(&self, i: usize) -> String {
        match self {
            Column::Num(v) => v[i].to_string(),
            Column::Bool(v) => v[i].to_string(),
            Column::Str(v) => v[i].clone().unwrap_or_default(),
            Column::Factor(f) => f.label(i).to_string(),
        }
    }
}

/// Row-aligned metadata: an identifier per row plus named columns, ordered by name.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Table {
    ids: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Table {
    /// Create a table with identifiers and no columns
    pub fn new(ids: Vec<String>) -> Table {
        Table {
            ids,
            columns: BTreeMap::new(),
        }
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.ids.len()
    }

    /// Row identifiers
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Column names, in order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Iterate over (name, column) pairs, in order
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up a column
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// True if the table has a column named `name`
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Add or replace a column. Fails if the length doesn't match the number of rows.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Table, Error> {
        let name = name.into();
        if column.len() != self.nrows() {
            bail!(
                "column '{}' has {} entries but the table has {} rows",
                name,
                column.len(),
                self.nrows()
            );
        }
        self.columns.insert(name, column);
        Ok(self)
    }

    fn require(&self, name: &str) -> Result<&Column, Error> {
        self.columns
            .get(name)
            .ok_or_else(|| format_err!("column '{}' not found", name))
    }

    /// Numeric column by name
    pub fn num(&self, name: &str) -> Result<&[f64], Error> {
        match self.require(name)? {
            Column::Num(v) => Ok(v),
            _ => bail!("column '{}' is not numeric", name),
        }
    }

    /// Boolean column by name
    pub fn flags(&self, name: &str) -> Result<&[bool], Error> {
        match self.require(name)? {
            Column::Bool(v) => Ok(v),
            _ => bail!("column '{}' is not boolean", name),
        }
    }

    /// Text column by name
    pub fn text(&self, name: &str) -> Result<&[Option<String>], Error> {
        match self.require(name)? {
            Column::Str(v) => Ok(v),
            _ => bail!("column '{}' is not text", name),
        }
    }

    /// Categorical column by name. Text columns are converted on the fly, with missing values
    /// becoming the level "NA".
    pub fn factor(&self, name: &str) -> Result<Factor, Error> {
        match self.require(name)? {
            Column::Factor(f) => Ok(f.clone()),
            Column::Str(v) => {
                let labels = v
                    .iter()
                    .map(|s| s.as_deref().unwrap_or("NA"))
                    .collect::<Vec<_>>();
                Ok(Factor::from_labels(&labels))
            }
            _ => bail!("column '{}' is not categorical", name),
        }
    }

    /// Rows at `idx`, in that order, across ids and every column
    pub fn subset(&self, idx: &[usize]) -> Table {
        Table {
            ids: idx.iter().map(|&i| self.ids[i].clone()).collect(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.subset(idx)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{i}")).collect()
    }

    #[test]
    fn test_column_length_checked() {
        let t = Table::new(ids(3));
        assert!(t.clone().with_column("x", Column::Num(vec![1.0, 2.0])).is_err());
        let t = t.with_column("x", Column::Num(vec![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(t.num("x").unwrap(), &[1.0, 2.0, 3.0]);
        assert!(t.flags("x").is_err());
        assert!(t.num("missing").is_err());
    }

    #[test]
    fn test_subset_keeps_rows_aligned() {
        let t = Table::new(ids(4))
            .with_column("x", Column::Num(vec![0.0, 1.0, 2.0, 3.0]))
            .unwrap()
            .with_column(
                "s",
                Column::Str(vec![Some("a".into()), None, Some("c".into()), Some("d".into())]),
            )
            .unwrap();
        let s = t.subset(&[3, 1]);
        assert_eq!(s.ids(), &["c3", "c1"]);
        assert_eq!(s.num("x").unwrap(), &[3.0, 1.0]);
        assert_eq!(s.text("s").unwrap(), &[Some("d".to_string()), None]);
        assert_eq!(s.get("s").unwrap().render(1), "");
    }

    #[test]
    fn test_text_as_factor() {
        let t = Table::new(ids(3))
            .with_column(
                "donor",
                Column::Str(vec![Some("d1".into()), None, Some("d1".into())]),
            )
            .unwrap();
        let f = t.factor("donor").unwrap();
        assert_eq!(f.levels(), &["d1", "NA"]);
        assert_eq!(f.codes(), &[0, 1, 0]);
    }
}
