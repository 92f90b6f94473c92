use serde_json::Value;

use crate::api::connector::Transform;
use crate::api::element::Row;
use crate::api::properties::Properties;

pub const SRC_FIELD: &str = "src_field";
pub const FIELD: &str = "field";

fn field_index(properties: &Properties, key: &str) -> anyhow::Result<Option<usize>> {
    match properties.get_u32(key) {
        Ok(v) => Ok(Some(v as usize)),
        Err(e) if e.is_none() => Ok(None),
        Err(e) => Err(anyhow!("property `{}`: {}", key, e)),
    }
}

/// Appends a copy of field `src_field` (default 0) to every row.
#[derive(Clone, Debug)]
pub struct CopyField {
    src_field: usize,
}

impl CopyField {
    pub fn new(properties: &Properties) -> anyhow::Result<Self> {
        Ok(CopyField {
            src_field: field_index(properties, SRC_FIELD)?.unwrap_or(0),
        })
    }
}

impl Transform for CopyField {
    fn map(&mut self, mut row: Row) -> anyhow::Result<Option<Row>> {
        let value = row
            .field(self.src_field)
            .cloned()
            .ok_or_else(|| anyhow!("row has no field {}", self.src_field))?;
        row.fields.push(value);
        Ok(Some(row))
    }
}

/// Upper-cases string fields; only `field` when configured.
#[derive(Clone, Debug)]
pub struct Uppercase {
    field: Option<usize>,
}

impl Uppercase {
    pub fn new(properties: &Properties) -> anyhow::Result<Self> {
        Ok(Uppercase {
            field: field_index(properties, FIELD)?,
        })
    }
}

impl Transform for Uppercase {
    fn map(&mut self, mut row: Row) -> anyhow::Result<Option<Row>> {
        for (index, value) in row.fields.iter_mut().enumerate() {
            if self.field.map(|f| f != index).unwrap_or(false) {
                continue;
            }
            if let Value::String(s) = value {
                *s = s.to_uppercase();
            }
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::api::connector::Transform;
    use crate::api::element::Row;
    use crate::api::properties::Properties;
    use crate::functions::source::vec_source::vec_row;
    use crate::functions::transform::{CopyField, Uppercase, FIELD, SRC_FIELD};

    #[test]
    pub fn copy_field_test() {
        let mut properties = Properties::new();
        properties.set_u32(SRC_FIELD, 1);
        let mut copy = CopyField::new(&properties).unwrap();
        let row = copy.map(vec_row(3)).unwrap().unwrap();
        assert_eq!(row.fields.len(), 3);
        assert_eq!(row.field(2), Some(&Value::from("row-3")));

        properties.set_u32(SRC_FIELD, 9);
        let mut copy = CopyField::new(&properties).unwrap();
        assert!(copy.map(vec_row(3)).is_err());
    }

    #[test]
    pub fn uppercase_test() {
        let mut upper = Uppercase::new(&Properties::new()).unwrap();
        let row = upper.map(vec_row(5)).unwrap().unwrap();
        assert_eq!(row, Row::new(vec![Value::from(5), Value::from("ROW-5")]));

        let mut properties = Properties::new();
        properties.set_u32(FIELD, 0);
        let mut upper = Uppercase::new(&properties).unwrap();
        let row = upper
            .map(Row::new(vec![Value::from("a"), Value::from("b")]))
            .unwrap()
            .unwrap();
        assert_eq!(row, Row::new(vec![Value::from("A"), Value::from("b")]));
    }
}
