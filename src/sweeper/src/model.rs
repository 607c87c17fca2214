use chrono::{DateTime, Utc};

/// Storage status of a deletion event.
///
/// Stored as an integer so racing consumers can flip it with a single
/// conditional UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Processed,
}

impl RecordStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(RecordStatus::Pending),
            2 => Some(RecordStatus::Processed),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            RecordStatus::Pending => 1,
            RecordStatus::Processed => 2,
        }
    }
}

/// One record of a parent row's disappearance.
///
/// Identity is the composite `(partition, id)`; the partition number is
/// part of the key because the log is physically partitioned by it.
#[derive(Debug, Clone)]
pub struct DeletedRecord {
    pub partition: i64,
    pub id: i64,
    /// Table that lost the row
    pub fully_qualified_table_name: String,
    /// Primary key of the deleted row
    pub primary_key_value: i64,
    pub status: RecordStatus,
    /// Not eligible for processing before this time
    pub consume_after: DateTime<Utc>,
    pub cleanup_attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// One entry of the partition control table.
#[derive(Debug, Clone)]
pub struct Partition {
    pub number: i64,
    pub created_at: DateTime<Utc>,
    /// Whether this partition is the current write target
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(RecordStatus::from_i64(1), Some(RecordStatus::Pending));
        assert_eq!(RecordStatus::from_i64(2), Some(RecordStatus::Processed));
        assert_eq!(RecordStatus::from_i64(0), None);
        assert_eq!(RecordStatus::from_i64(3), None);
        assert_eq!(RecordStatus::Pending.as_i64(), 1);
        assert_eq!(RecordStatus::Processed.as_i64(), 2);
    }
}
