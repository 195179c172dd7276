use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DataUnit {
    B,
    KB,
    MB,
    GB,
    TB,
}

const UNITS: [DataUnit; 5] = [DataUnit::B, DataUnit::KB, DataUnit::MB, DataUnit::GB, DataUnit::TB];

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct DataSize {
    pub value: f64,
    pub unit: DataUnit,
}

impl DataSize {
    /// Expresses `bytes` in the largest unit whose value is still at least one.
    pub fn succinct(bytes: u64) -> Self {
        let mut value = bytes as f64;
        let mut unit = DataUnit::B;
        for next in &UNITS[1..] {
            if value < 1024.0 {
                break;
            }
            value /= 1024.0;
            unit = *next;
        }
        Self { value, unit }
    }
}

/// In-memory summary of a finished query.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_id: String,
    pub columns: Vec<String>,
    pub records: Vec<Vec<Option<String>>>,
    pub line_number: u64,
    pub raw_data_size: DataSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
}
