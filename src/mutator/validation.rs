use crate::core::{Collection, Record, Result, SyncError, Value};
use chrono::{DateTime, Utc};

/// Checks a record before it may be applied to the store.
pub fn check_record(record: &Record) -> Result<()> {
    let field = record.collection.display_field();
    match record.field(field) {
        None | Some(Value::Null) => {
            return Err(SyncError::Validation(format!(
                "{} requires a '{}'",
                record.collection, field
            )));
        }
        Some(Value::Text(text)) if text.trim().is_empty() => {
            return Err(SyncError::Validation(format!(
                "'{}' of {} must not be blank",
                field, record.collection
            )));
        }
        Some(Value::Text(_)) => {}
        Some(other) => {
            return Err(SyncError::Validation(format!(
                "'{}' must be TEXT, got {}",
                field,
                other.type_name()
            )));
        }
    }

    if record.member_ids.iter().any(|member| member.trim().is_empty()) {
        return Err(SyncError::Validation("member ids must not be blank".to_string()));
    }
    if record.collection == Collection::Families && record.member_ids.is_empty() {
        return Err(SyncError::Validation(
            "a family needs at least one member".to_string(),
        ));
    }
    Ok(())
}

/// Normalizes and validates a draft for optimistic creation.
pub fn prepare_draft(collection: Collection, draft: Record, now: DateTime<Utc>) -> Result<Record> {
    if draft.collection != collection {
        return Err(SyncError::Validation(format!(
            "draft belongs to {}, not {}",
            draft.collection, collection
        )));
    }
    if draft.id.is_confirmed() {
        return Err(SyncError::Validation(format!(
            "draft already carries server id {}",
            draft.id
        )));
    }

    let mut draft = draft;
    draft.fields = std::mem::take(&mut draft.fields)
        .into_iter()
        .map(|(name, value)| (name, value.normalized()))
        .collect();
    draft.created_at = Some(now);
    draft.updated_at = Some(now);

    check_record(&draft)?;
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identifier;

    #[test]
    fn test_blank_name_is_rejected() {
        let draft = Record::draft(Collection::Families)
            .with_field("name", "   ")
            .with_members(["u1"]);
        let err = prepare_draft(Collection::Families, draft, Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_task_requires_title() {
        let draft = Record::draft(Collection::Tasks).with_field("name", "wrong field");
        assert!(prepare_draft(Collection::Tasks, draft, Utc::now()).is_err());
    }

    #[test]
    fn test_draft_is_trimmed_and_stamped() {
        let now = Utc::now();
        let draft = Record::draft(Collection::Families)
            .with_field("name", "  Tanaka  ")
            .with_members(["u1"]);
        let token = draft.id.clone();

        let prepared = prepare_draft(Collection::Families, draft, now).unwrap();
        assert_eq!(prepared.display_name(), Some("Tanaka"));
        assert_eq!(prepared.created_at, Some(now));
        assert_eq!(prepared.id, token);
    }

    #[test]
    fn test_confirmed_draft_is_rejected() {
        let draft = Record::new(Identifier::from("f1"), Collection::Families)
            .with_field("name", "Tanaka")
            .with_members(["u1"]);
        assert!(prepare_draft(Collection::Families, draft, Utc::now()).is_err());
    }

    #[test]
    fn test_non_text_display_field_is_rejected() {
        let record = Record::new(Identifier::from("p1"), Collection::Projects).with_field("name", 42i64);
        let err = check_record(&record).unwrap_err();
        assert!(err.to_string().contains("INTEGER"));
    }
}
