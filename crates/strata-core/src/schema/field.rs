use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{OnDelete, SqlType};
use crate::error::{Result, StrataError};

/// Definition of a model field as recorded in migration operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name (snake_case, or camelCase for legacy fields).
    pub name: String,

    /// Semantic type of the field.
    #[serde(flatten)]
    pub kind: FieldKind,

    /// Whether the field is the model's primary key.
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,

    /// Whether NULL is stored for missing values.
    #[serde(default, skip_serializing_if = "is_false")]
    pub null: bool,

    /// Whether the empty value is accepted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub blank: bool,

    /// Unique constraint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,

    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enumerated choice set as (stored value, label) pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_name: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Field kinds understood by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Auto,
    BigAuto,
    Char { max_length: u32 },
    Text,
    Integer,
    BigInteger,
    Float,
    Boolean,
    Date,
    DateTime,
    ForeignKey(Relation),
    OneToOne(Relation),
    ManyToMany(ManyRelation),
}

/// Target and delete policy of a foreign key or one-to-one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Target model as `app.Model`.
    pub to: String,
    pub on_delete: OnDelete,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_query_name: Option<String>,
}

/// Target of a many-to-many field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyRelation {
    /// Target model as `app.Model`.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_query_name: Option<String>,
}

/// One entry of an enumerated choice set: stored value and display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice(pub String, pub String);

impl Choice {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self(value.into(), label.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn label(&self) -> &str {
        &self.1
    }
}

impl FieldKind {
    /// Foreign key with the given target and delete policy.
    pub fn foreign_key(to: impl Into<String>, on_delete: OnDelete) -> Self {
        FieldKind::ForeignKey(Relation {
            to: to.into(),
            on_delete,
            related_name: None,
            related_query_name: None,
        })
    }

    /// Many-to-many relation to the given target.
    pub fn many_to_many(to: impl Into<String>) -> Self {
        FieldKind::ManyToMany(ManyRelation {
            to: to.into(),
            related_name: None,
            related_query_name: None,
        })
    }

    /// Name used in operation descriptions and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Auto => "AutoField",
            FieldKind::BigAuto => "BigAutoField",
            FieldKind::Char { .. } => "CharField",
            FieldKind::Text => "TextField",
            FieldKind::Integer => "IntegerField",
            FieldKind::BigInteger => "BigIntegerField",
            FieldKind::Float => "FloatField",
            FieldKind::Boolean => "BooleanField",
            FieldKind::Date => "DateField",
            FieldKind::DateTime => "DateTimeField",
            FieldKind::ForeignKey(_) => "ForeignKey",
            FieldKind::OneToOne(_) => "OneToOneField",
            FieldKind::ManyToMany(_) => "ManyToManyField",
        }
    }

    /// Column type, `None` for many-to-many fields (stored in a join table).
    pub fn sql_type(&self) -> Option<SqlType> {
        let ty = match self {
            FieldKind::Auto => SqlType::Serial,
            FieldKind::BigAuto => SqlType::BigSerial,
            FieldKind::Char { max_length } => SqlType::Varchar(*max_length),
            FieldKind::Text => SqlType::Text,
            FieldKind::Integer => SqlType::Integer,
            FieldKind::BigInteger => SqlType::BigInt,
            FieldKind::Float => SqlType::DoublePrecision,
            FieldKind::Boolean => SqlType::Boolean,
            FieldKind::Date => SqlType::Date,
            FieldKind::DateTime => SqlType::Timestamptz,
            FieldKind::ForeignKey(_) | FieldKind::OneToOne(_) => SqlType::Integer,
            FieldKind::ManyToMany(_) => return None,
        };
        Some(ty)
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, FieldKind::Auto | FieldKind::BigAuto)
    }

    fn is_textual(&self) -> bool {
        matches!(self, FieldKind::Char { .. } | FieldKind::Text)
    }
}

impl FieldDef {
    /// Create a new field definition with no constraints.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: false,
            null: false,
            blank: false,
            unique: false,
            default: None,
            choices: Vec::new(),
            verbose_name: None,
        }
    }

    /// The conventional auto-incrementing `id` primary key.
    pub fn auto_id() -> Self {
        let mut field = Self::new("id", FieldKind::Auto);
        field.primary_key = true;
        field.verbose_name = Some("ID".to_string());
        field
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn blank(mut self) -> Self {
        self.blank = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_choices<I, V, L>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = (V, L)>,
        V: Into<String>,
        L: Into<String>,
    {
        self.choices = choices
            .into_iter()
            .map(|(v, l)| Choice::new(v, l))
            .collect();
        self
    }

    pub fn with_verbose_name(mut self, name: impl Into<String>) -> Self {
        self.verbose_name = Some(name.into());
        self
    }

    /// Column holding this field's value, `None` for many-to-many fields.
    pub fn column_name(&self) -> Option<String> {
        match self.kind {
            FieldKind::ForeignKey(_) | FieldKind::OneToOne(_) => Some(format!("{}_id", self.name)),
            FieldKind::ManyToMany(_) => None,
            _ => Some(self.name.clone()),
        }
    }

    pub fn sql_type(&self) -> Option<SqlType> {
        self.kind.sql_type()
    }

    pub fn max_length(&self) -> Option<u32> {
        match self.kind {
            FieldKind::Char { max_length } => Some(max_length),
            _ => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.relation_target().is_some()
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self.kind, FieldKind::ManyToMany(_))
    }

    /// Target model reference of a relational field.
    pub fn relation_target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => Some(&rel.to),
            FieldKind::ManyToMany(rel) => Some(&rel.to),
            _ => None,
        }
    }

    /// Delete policy of a foreign key or one-to-one field.
    pub fn on_delete(&self) -> Option<OnDelete> {
        match &self.kind {
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => Some(rel.on_delete),
            _ => None,
        }
    }

    /// Reverse accessor name and reverse query name.
    pub fn related_names(&self) -> (Option<&str>, Option<&str>) {
        match &self.kind {
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                (rel.related_name.as_deref(), rel.related_query_name.as_deref())
            }
            FieldKind::ManyToMany(rel) => {
                (rel.related_name.as_deref(), rel.related_query_name.as_deref())
            }
            _ => (None, None),
        }
    }

    pub fn choice_values(&self) -> Vec<&str> {
        self.choices.iter().map(Choice::value).collect()
    }

    /// Value stored in existing rows when the column is added or made NOT NULL.
    pub fn effective_default(&self) -> Option<Value> {
        if let Some(ref default) = self.default {
            return Some(default.clone());
        }
        if self.null {
            return Some(Value::Null);
        }
        if self.blank && self.kind.is_textual() {
            return Some(Value::String(String::new()));
        }
        None
    }

    /// Check that the definition itself is consistent.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StrataError::Validation(format!(
                "invalid field name '{}'",
                self.name
            )));
        }

        if self.primary_key && self.null {
            return Err(StrataError::Validation(format!(
                "primary key '{}' cannot be nullable",
                self.name
            )));
        }

        match &self.kind {
            FieldKind::Char { max_length } => {
                if *max_length == 0 {
                    return Err(StrataError::Validation(format!(
                        "char field '{}' requires a positive max_length",
                        self.name
                    )));
                }
                if let Some(choice) = self
                    .choices
                    .iter()
                    .find(|c| c.value().chars().count() > *max_length as usize)
                {
                    return Err(StrataError::Validation(format!(
                        "choice '{}' of field '{}' exceeds max_length {}",
                        choice.value(),
                        self.name,
                        max_length
                    )));
                }
            }
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => match rel.on_delete {
                OnDelete::SetNull if !self.null => {
                    return Err(StrataError::Validation(format!(
                        "field '{}' specifies on_delete=SET_NULL but cannot be null",
                        self.name
                    )));
                }
                OnDelete::SetDefault if self.default.is_none() => {
                    return Err(StrataError::Validation(format!(
                        "field '{}' specifies on_delete=SET_DEFAULT but has no default value",
                        self.name
                    )));
                }
                _ => {}
            },
            FieldKind::ManyToMany(_) => {
                if self.default.is_some() || !self.choices.is_empty() || self.primary_key {
                    return Err(StrataError::Validation(format!(
                        "many-to-many field '{}' cannot declare a default, choices or primary key",
                        self.name
                    )));
                }
            }
            _ => {}
        }

        if let Some(ref default) = self.default {
            if !default.is_null() {
                self.validate_value(default).map_err(|e| {
                    StrataError::Validation(format!(
                        "default of field '{}' is invalid: {}",
                        self.name, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Check a value against the column constraints of this field.
    pub fn validate_value(&self, value: &Value) -> Result<()> {
        let column = self.column_name().unwrap_or_else(|| self.name.clone());

        if value.is_null() {
            if self.null || self.kind.is_serial() {
                return Ok(());
            }
            return Err(StrataError::Integrity(format!(
                "null value in column \"{}\" violates not-null constraint",
                column
            )));
        }

        let type_ok = match &self.kind {
            FieldKind::Char { max_length } => match value.as_str() {
                Some(s) if s.chars().count() > *max_length as usize => {
                    return Err(StrataError::Integrity(format!(
                        "value too long for type character varying({}) in column \"{}\"",
                        max_length, column
                    )));
                }
                Some(_) => true,
                None => false,
            },
            FieldKind::Text => value.is_string(),
            FieldKind::Auto
            | FieldKind::BigAuto
            | FieldKind::Integer
            | FieldKind::BigInteger
            | FieldKind::ForeignKey(_)
            | FieldKind::OneToOne(_) => value.is_i64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Date => value
                .as_str()
                .is_some_and(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
            FieldKind::DateTime => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            FieldKind::ManyToMany(_) => {
                return Err(StrataError::Validation(format!(
                    "many-to-many field '{}' has no column value",
                    self.name
                )));
            }
        };

        if !type_ok {
            return Err(StrataError::Integrity(format!(
                "invalid input {} for {} column \"{}\"",
                value,
                self.kind.label(),
                column
            )));
        }

        if !self.choices.is_empty() {
            let repr = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let blank_ok = self.blank && repr.is_empty();
            if !blank_ok && !self.choices.iter().any(|c| c.value() == repr) {
                return Err(StrataError::Integrity(format!(
                    "value {:?} for column \"{}\" is not one of the allowed choices",
                    repr, column
                )));
            }
        }

        Ok(())
    }
}

/// Split a relation target (`app.Model` or bare `Model`) into `(app, model_lower)`.
pub fn resolve_model_ref(reference: &str, default_app: &str) -> (String, String) {
    match reference.split_once('.') {
        Some((app, model)) => (app.to_string(), model.to_lowercase()),
        None => (default_app.to_string(), reference.to_lowercase()),
    }
}

/// Physical table name of a model.
pub fn table_name(app: &str, model: &str) -> String {
    format!("{}_{}", app.to_lowercase(), model.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn avatar() -> FieldDef {
        FieldDef::new("avatar", FieldKind::Char { max_length: 10 })
            .blank()
            .with_choices([("bear", "Bear"), ("cat", "Cat"), ("reindeer", "Reindeer")])
    }

    #[test]
    fn test_column_names() {
        let fk = FieldDef::new("preschool", FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull))
            .nullable();
        assert_eq!(fk.column_name().as_deref(), Some("preschool_id"));
        assert_eq!(fk.sql_type(), Some(SqlType::Integer));

        let m2m = FieldDef::new("student_user", FieldKind::many_to_many("yoyaku.StudentProfile"));
        assert_eq!(m2m.column_name(), None);
        assert_eq!(m2m.sql_type(), None);
    }

    #[test]
    fn test_choice_enforcement() {
        let field = avatar();
        assert!(field.validate_value(&json!("bear")).is_ok());
        assert!(field.validate_value(&json!("")).is_ok());
        let err = field.validate_value(&json!("unicorn")).unwrap_err();
        assert!(matches!(err, StrataError::Integrity(_)));
    }

    #[test]
    fn test_max_length_enforced() {
        let field = FieldDef::new("name", FieldKind::Char { max_length: 3 });
        assert!(field.validate_value(&json!("abc")).is_ok());
        assert!(field.validate_value(&json!("abcd")).is_err());
    }

    #[test]
    fn test_not_null_enforced() {
        let field = FieldDef::new("limit", FieldKind::Integer);
        assert!(field.validate_value(&Value::Null).is_err());
        assert!(field.clone().nullable().validate_value(&Value::Null).is_ok());
        assert!(field.validate_value(&json!("ten")).is_err());
    }

    #[test]
    fn test_set_null_requires_nullable() {
        let field = FieldDef::new("preschool", FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull));
        assert!(field.validate().is_err());
        assert!(field.nullable().validate().is_ok());
    }

    #[test]
    fn test_default_must_be_a_choice() {
        let field = FieldDef::new("should_pay_signup_fee", FieldKind::Char { max_length: 30 })
            .with_choices([("pay_full", "pay_full"), ("referral", "referral")]);
        assert!(field.clone().with_default("referral").validate().is_ok());
        assert!(field.with_default("free").validate().is_err());
    }

    #[test]
    fn test_choice_longer_than_max_length_rejected() {
        let field = FieldDef::new("avatar", FieldKind::Char { max_length: 4 })
            .with_choices([("reindeer", "Reindeer")]);
        assert!(field.validate().is_err());
    }

    #[test]
    fn test_effective_default() {
        assert_eq!(avatar().effective_default(), Some(json!("")));
        assert_eq!(FieldDef::new("limit", FieldKind::Integer).effective_default(), None);
        assert_eq!(
            FieldDef::new("limit", FieldKind::Integer).nullable().effective_default(),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_parse_field_from_toml() {
        let field: FieldDef = toml::from_str(
            r#"
            name = "teacher_user"
            kind = "foreign_key"
            to = "yoyaku.TeacherProfile"
            on_delete = "CASCADE"
            related_name = "teacherEvents"
            related_query_name = "teacherEvent"
            "#,
        )
        .unwrap();
        assert_eq!(field.on_delete(), Some(OnDelete::Cascade));
        assert_eq!(field.related_names(), (Some("teacherEvents"), Some("teacherEvent")));
        assert!(!field.null);
    }

    #[test]
    fn test_resolve_model_ref() {
        assert_eq!(
            resolve_model_ref("yoyaku.StudentProfile", "other"),
            ("yoyaku".to_string(), "studentprofile".to_string())
        );
        assert_eq!(
            resolve_model_ref("Event", "yoyaku"),
            ("yoyaku".to_string(), "event".to_string())
        );
        assert_eq!(table_name("yoyaku", "PreschoolClass"), "yoyaku_preschoolclass");
    }
}
