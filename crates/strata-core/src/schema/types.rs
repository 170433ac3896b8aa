use serde::{Deserialize, Serialize};

/// PostgreSQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    /// Auto-incrementing 32-bit integer
    Serial,
    /// Auto-incrementing 64-bit integer
    BigSerial,
    /// Variable-length string with max length
    Varchar(u32),
    /// Unlimited text
    Text,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    BigInt,
    /// 64-bit floating point
    DoublePrecision,
    /// Boolean
    Boolean,
    /// Date without time
    Date,
    /// Timestamp with timezone
    Timestamptz,
}

impl SqlType {
    /// Generate the SQL type declaration.
    pub fn to_sql(&self) -> String {
        match self {
            SqlType::Serial => "SERIAL".to_string(),
            SqlType::BigSerial => "BIGSERIAL".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::DoublePrecision => "DOUBLE PRECISION".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamptz => "TIMESTAMPTZ".to_string(),
        }
    }

    /// Type used when altering an existing column (serial types only exist at creation).
    pub fn to_alter_sql(&self) -> String {
        match self {
            SqlType::Serial => SqlType::Integer.to_sql(),
            SqlType::BigSerial => SqlType::BigInt.to_sql(),
            other => other.to_sql(),
        }
    }

    /// Whether values are generated by the store on insert.
    pub fn is_serial(&self) -> bool {
        matches!(self, SqlType::Serial | SqlType::BigSerial)
    }
}

/// What happens to referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDelete {
    Cascade,
    SetNull,
    SetDefault,
    Protect,
    Restrict,
    DoNothing,
}

impl OnDelete {
    /// Referential action clause for the foreign key constraint.
    pub fn to_sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::SetDefault => "SET DEFAULT",
            OnDelete::Protect | OnDelete::Restrict => "RESTRICT",
            OnDelete::DoNothing => "NO ACTION",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET_NULL",
            OnDelete::SetDefault => "SET_DEFAULT",
            OnDelete::Protect => "PROTECT",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::DoNothing => "DO_NOTHING",
        }
    }
}

impl std::fmt::Display for OnDelete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_to_sql() {
        assert_eq!(SqlType::Serial.to_sql(), "SERIAL");
        assert_eq!(SqlType::Varchar(10).to_sql(), "VARCHAR(10)");
        assert_eq!(SqlType::DoublePrecision.to_sql(), "DOUBLE PRECISION");
    }

    #[test]
    fn test_serial_types_alter_as_integers() {
        assert_eq!(SqlType::Serial.to_alter_sql(), "INTEGER");
        assert_eq!(SqlType::BigSerial.to_alter_sql(), "BIGINT");
        assert_eq!(SqlType::Text.to_alter_sql(), "TEXT");
    }

    #[test]
    fn test_on_delete_sql() {
        assert_eq!(OnDelete::SetNull.to_sql(), "SET NULL");
        assert_eq!(OnDelete::Protect.to_sql(), "RESTRICT");
        assert_eq!(OnDelete::DoNothing.to_sql(), "NO ACTION");
    }

    #[test]
    fn test_on_delete_parses_policy_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: OnDelete,
        }
        let w: Wrapper = toml::from_str(r#"policy = "SET_NULL""#).unwrap();
        assert_eq!(w.policy, OnDelete::SetNull);
    }
}
