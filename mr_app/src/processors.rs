use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Context};
use mr::{KeyValue, Mapper, Processors, Reducer};

/// Every processor the worker binary ships with.
pub fn registry() -> Processors {
    Processors::new()
        .with("wc", WordCount)
        .with("avg", Average)
        .with("select", Select::new("name", "Jill"))
        .with(
            "join",
            Join::new([("students", "id"), ("enrollments", "student_id")]),
        )
}

/// Counts whitespace separated words.
pub struct WordCount;

impl Mapper for WordCount {
    fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>> {
        let text = std::str::from_utf8(data).context("input is not utf-8")?;
        Ok(text
            .split_whitespace()
            .map(|word| KeyValue::new(word, "1"))
            .collect())
    }
}

impl Reducer for WordCount {
    fn reduce(&self, _key: &str, values: &[String]) -> anyhow::Result<String> {
        Ok(values.len().to_string())
    }
}

/// Emits `sum` and `cnt` per input; reduces both by summation so that
/// `sum / cnt` is the mean over all inputs.
pub struct Average;

impl Mapper for Average {
    fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>> {
        let text = std::str::from_utf8(data).context("input is not utf-8")?;
        let (mut sum, mut cnt) = (0i64, 0i64);
        for field in text.split_whitespace() {
            sum += field
                .parse::<i64>()
                .with_context(|| format!("{field:?} is not an integer"))?;
            cnt += 1;
        }
        Ok(vec![
            KeyValue::new("sum", sum.to_string()),
            KeyValue::new("cnt", cnt.to_string()),
        ])
    }
}

impl Reducer for Average {
    fn reduce(&self, key: &str, values: &[String]) -> anyhow::Result<String> {
        let mut total = 0i64;
        for value in values {
            total += value
                .parse::<i64>()
                .with_context(|| format!("{key}: {value:?} is not an integer"))?;
        }
        Ok(total.to_string())
    }
}

/// Inner join of two CSV tables.
///
/// An input file is one table: its name on the first line, the header on
/// the second, rows after that. `on` names the join column per table.
///
/// A table with a header but no rows maps to nothing rather than failing,
/// and a key found in only one table reduces to `[]` instead of an error.
/// Keys spanning more than two tables still fail the reduce.
pub struct Join {
    on: HashMap<String, String>,
}

const TABLE_FIELD: &str = "_table";

type Row = BTreeMap<String, String>;

impl Join {
    pub fn new<'a>(on: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Join {
            on: on
                .into_iter()
                .map(|(table, column)| (table.to_string(), column.to_string()))
                .collect(),
        }
    }
}

/// A table file split into its name, header columns and non-blank rows.
struct Table<'a> {
    name: &'a str,
    columns: Vec<&'a str>,
    rows: Vec<&'a str>,
}

impl<'a> Table<'a> {
    fn parse(data: &'a [u8]) -> anyhow::Result<Self> {
        let text = std::str::from_utf8(data).context("input is not utf-8")?;
        let mut lines = text.lines();
        let (Some(name), Some(header)) = (lines.next(), lines.next()) else {
            bail!("empty table");
        };
        Ok(Table {
            name: name.trim(),
            columns: header.split(',').map(str::trim).collect(),
            rows: lines.filter(|l| !l.trim().is_empty()).collect(),
        })
    }

    fn column(&self, column: &str) -> anyhow::Result<usize> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .ok_or_else(|| anyhow!("column {column} is not in table {}", self.name))
    }
}

/// Rows of a table whose `column` equals `value`, keyed by their first cell.
///
/// Takes the same table files as [`Join`]. Each match maps to the row as a
/// JSON object of column to cell; reduce keeps the first row per key.
pub struct Select {
    column: String,
    value: String,
}

impl Select {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Select {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl Mapper for Select {
    fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>> {
        let table = Table::parse(data)?;
        let idx = table.column(&self.column)?;

        let mut kvs = Vec::new();
        for line in &table.rows {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != table.columns.len() {
                bail!("row {line:?} does not match the header of table {}", table.name);
            }
            if cells[idx] != self.value {
                continue;
            }
            let row: Row = table
                .columns
                .iter()
                .zip(&cells)
                .map(|(column, cell)| (column.to_string(), cell.to_string()))
                .collect();
            kvs.push(KeyValue::new(cells[0], serde_json::to_string(&row)?));
        }
        Ok(kvs)
    }
}

impl Reducer for Select {
    fn reduce(&self, key: &str, values: &[String]) -> anyhow::Result<String> {
        values
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no rows for key {key}"))
    }
}

impl Mapper for Join {
    fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>> {
        let Table {
            name: table,
            columns,
            rows,
        } = Table::parse(data)?;
        let on = self
            .on
            .get(table)
            .ok_or_else(|| anyhow!("join column of table {table} not found"))?;
        let on_idx = columns
            .iter()
            .position(|c| *c == on.as_str())
            .ok_or_else(|| anyhow!("join column {on} is not in table {table}"))?;

        let mut kvs = Vec::new();
        for line in rows {
            let mut key = None;
            let mut row = Row::new();
            row.insert(TABLE_FIELD.to_string(), table.to_string());
            for (i, cell) in line.split(',').map(str::trim).enumerate() {
                let column = columns
                    .get(i)
                    .ok_or_else(|| anyhow!("row {line:?} has more cells than the header"))?;
                if i == on_idx {
                    key = Some(cell.to_string());
                } else {
                    row.insert(format!("{table}.{column}"), cell.to_string());
                }
            }
            let key = key.ok_or_else(|| anyhow!("row {line:?} has no join column"))?;
            kvs.push(KeyValue::new(key, serde_json::to_string(&row)?));
        }
        Ok(kvs)
    }
}

impl Reducer for Join {
    fn reduce(&self, key: &str, values: &[String]) -> anyhow::Result<String> {
        let mut tables: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for value in values {
            let mut row: Row = serde_json::from_str(value)
                .with_context(|| format!("decoding row for key {key}"))?;
            let table = row
                .remove(TABLE_FIELD)
                .ok_or_else(|| anyhow!("row for key {key} has no table"))?;
            tables.entry(table).or_default().push(row);
        }
        if tables.len() > 2 {
            bail!("only joins between two tables are supported, key {key} spans {}", tables.len());
        }

        let mut joined = Vec::new();
        if let [(_, left), (_, right)] = tables.into_iter().collect::<Vec<_>>().as_slice() {
            for a in left {
                for b in right {
                    let mut row = a.clone();
                    row.extend(b.clone());
                    joined.push(row);
                }
            }
        }
        Ok(serde_json::to_string(&joined)?)
    }
}
