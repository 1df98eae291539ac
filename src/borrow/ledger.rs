use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{BorrowError, BorrowResult};
use crate::model::{BookSummary, UserSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorrowStatus {
    Requested,
    Approved,
    Rejected,
    Returned,
}

impl BorrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowStatus::Requested => "requested",
            BorrowStatus::Approved => "approved",
            BorrowStatus::Rejected => "rejected",
            BorrowStatus::Returned => "returned",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(BorrowStatus::Requested),
            "approved" => Some(BorrowStatus::Approved),
            "rejected" => Some(BorrowStatus::Rejected),
            "returned" => Some(BorrowStatus::Returned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BorrowStatus::Rejected | BorrowStatus::Returned)
    }

    /// requested -> approved -> returned, requested -> rejected.
    pub fn can_transition_to(&self, next: BorrowStatus) -> bool {
        matches!(
            (self, next),
            (BorrowStatus::Requested, BorrowStatus::Approved)
                | (BorrowStatus::Requested, BorrowStatus::Rejected)
                | (BorrowStatus::Approved, BorrowStatus::Returned)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowRequest {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub status: BorrowStatus,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowRequestWithBook {
    #[serde(flatten)]
    pub request: BorrowRequest,
    pub book: Option<BookSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowRequestWithUserAndBook {
    #[serde(flatten)]
    pub request: BorrowRequest,
    pub user: Option<UserSummary>,
    pub book: Option<BookSummary>,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in borrow_requests: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(raw: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

const REQUEST_COLUMNS: &str =
    "r.id, r.user_id, r.book_id, r.status, r.requested_at, r.approved_at, r.returned_at, r.due_date";

/// Storage of borrow requests. Rows are never deleted.
pub struct Ledger<'a> {
    db: &'a Database,
}

impl<'a> Ledger<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    fn row_to_request(row: &libsql::Row) -> anyhow::Result<BorrowRequest> {
        let status: String = row.get(3)?;
        Ok(BorrowRequest {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            status: BorrowStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("unknown borrow status: {status}"))?,
            requested_at: parse_ts(&row.get::<String>(4)?)?,
            approved_at: parse_opt_ts(row.get::<Option<String>>(5)?)?,
            returned_at: parse_opt_ts(row.get::<Option<String>>(6)?)?,
            due_date: parse_opt_ts(row.get::<Option<String>>(7)?)?,
        })
    }

    fn book_summary(row: &libsql::Row, book_id: i64, offset: i32) -> anyhow::Result<Option<BookSummary>> {
        let title: Option<String> = row.get(offset)?;
        let author: Option<String> = row.get(offset + 1)?;
        Ok(title.map(|title| BookSummary {
            id: book_id,
            title,
            author: author.unwrap_or_default(),
        }))
    }

    fn user_summary(row: &libsql::Row, user_id: i64, offset: i32) -> anyhow::Result<Option<UserSummary>> {
        let name: Option<String> = row.get(offset)?;
        let email: Option<String> = row.get(offset + 1)?;
        Ok(name.map(|name| UserSummary {
            id: user_id,
            name,
            email: email.unwrap_or_default(),
        }))
    }

    /// Inserts a fresh `requested` record. Fails with `Conflict` when the book
    /// already has a pending request.
    pub async fn insert(
        &self,
        user_id: i64,
        book_id: i64,
        requested_at: DateTime<Utc>,
        due_date: Option<DateTime<Utc>>,
    ) -> BorrowResult<BorrowRequest> {
        let _guard = self.db.write_lock().await;

        if !self
            .query_active_by_book(book_id, &[BorrowStatus::Requested])
            .await?
            .is_empty()
        {
            return Err(BorrowError::Conflict("Book already requested by another user".to_string()));
        }

        let query = r#"
            INSERT INTO borrow_requests (user_id, book_id, status, requested_at, due_date)
            VALUES (?, ?, 'requested', ?, ?)
            RETURNING id, user_id, book_id, status, requested_at, approved_at, returned_at, due_date
        "#;

        let duplicate = |e: libsql::Error| {
            if is_unique_violation(&e) {
                BorrowError::Conflict("Book already requested by another user".to_string())
            } else {
                e.into()
            }
        };

        let mut rows = self
            .db
            .connection()
            .query(
                query,
                libsql::params![user_id, book_id, format_ts(&requested_at), due_date.as_ref().map(format_ts)],
            )
            .await
            .map_err(duplicate)?;

        if let Some(row) = rows.next().await.map_err(duplicate)? {
            Ok(Self::row_to_request(&row)?)
        } else {
            Err(anyhow::anyhow!("Failed to create borrow request").into())
        }
    }

    pub async fn find_by_id(&self, id: i64) -> BorrowResult<BorrowRequest> {
        let _guard = self.db.read_lock().await;
        let query = format!("SELECT {REQUEST_COLUMNS} FROM borrow_requests r WHERE r.id = ?");
        let mut rows = self.db.connection().query(&query, libsql::params![id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Self::row_to_request(&row)?),
            None => Err(BorrowError::NotFound("Borrow request not found".to_string())),
        }
    }

    pub async fn find_active_by_book(
        &self,
        book_id: i64,
        statuses: &[BorrowStatus],
    ) -> BorrowResult<Vec<BorrowRequest>> {
        let _guard = self.db.read_lock().await;
        self.query_active_by_book(book_id, statuses).await
    }

    async fn query_active_by_book(
        &self,
        book_id: i64,
        statuses: &[BorrowStatus],
    ) -> BorrowResult<Vec<BorrowRequest>> {
        let mut found = Vec::new();
        if statuses.is_empty() {
            return Ok(found);
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query = format!(
            "SELECT {REQUEST_COLUMNS} FROM borrow_requests r WHERE r.book_id = ? AND r.status IN ({placeholders}) ORDER BY r.id"
        );
        let mut params: Vec<libsql::Value> = vec![book_id.into()];
        params.extend(statuses.iter().map(|s| libsql::Value::from(s.as_str().to_string())));

        let mut rows = self.db.connection().query(&query, params).await?;
        while let Some(row) = rows.next().await? {
            found.push(Self::row_to_request(&row)?);
        }
        Ok(found)
    }

    pub async fn list_by_user(&self, user_id: i64) -> BorrowResult<Vec<BorrowRequestWithBook>> {
        let _guard = self.db.read_lock().await;
        let query = format!(
            r#"
SELECT {REQUEST_COLUMNS}, b.title, b.author
FROM borrow_requests r
LEFT JOIN books b ON b.id = r.book_id
WHERE r.user_id = ?
ORDER BY r.requested_at DESC, r.id DESC
"#
        );

        let mut rows = self.db.connection().query(&query, libsql::params![user_id]).await?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next().await? {
            let request = Self::row_to_request(&row)?;
            let book = Self::book_summary(&row, request.book_id, 8)?;
            requests.push(BorrowRequestWithBook { request, book });
        }
        Ok(requests)
    }

    pub async fn list_all(&self) -> BorrowResult<Vec<BorrowRequestWithUserAndBook>> {
        let _guard = self.db.read_lock().await;
        let query = format!(
            r#"
SELECT {REQUEST_COLUMNS}, b.title, b.author, u.name, u.email
FROM borrow_requests r
LEFT JOIN books b ON b.id = r.book_id
LEFT JOIN users u ON u.id = r.user_id
ORDER BY r.requested_at DESC, r.id DESC
"#
        );

        let mut rows = self.db.connection().query(&query, ()).await?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next().await? {
            let request = Self::row_to_request(&row)?;
            let book = Self::book_summary(&row, request.book_id, 8)?;
            let user = Self::user_summary(&row, request.user_id, 10)?;
            requests.push(BorrowRequestWithUserAndBook { request, user, book });
        }
        Ok(requests)
    }

    /// Persists `next` only if the stored status still equals `expected`.
    /// Returns false when another writer got there first. Callers must hold
    /// [`Database::write_lock`].
    pub async fn update_if_status(&self, next: &BorrowRequest, expected: BorrowStatus) -> BorrowResult<bool> {
        let query = r#"
            UPDATE borrow_requests
            SET status = ?, approved_at = ?, returned_at = ?, due_date = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ? AND status = ?
        "#;

        let affected = self
            .db
            .connection()
            .execute(
                query,
                libsql::params![
                    next.status.as_str(),
                    next.approved_at.as_ref().map(format_ts),
                    next.returned_at.as_ref().map(format_ts),
                    next.due_date.as_ref().map(format_ts),
                    next.id,
                    expected.as_str()
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BorrowError::Conflict("Book already has an outstanding loan".to_string())
                } else {
                    e.into()
                }
            })?;

        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup() -> (Database, i64) {
        let db = Database::open_local(":memory:").await.unwrap();
        let book = db.create_book("Beloved", "Toni Morrison").await.unwrap();
        (db, book.id)
    }

    #[test]
    fn test_status_transitions() {
        use BorrowStatus::*;
        assert!(Requested.can_transition_to(Approved));
        assert!(Requested.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Returned));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Requested.can_transition_to(Returned));
        for terminal in [Rejected, Returned] {
            assert!(terminal.is_terminal());
            for next in [Requested, Approved, Rejected, Returned] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_second_pending_request() {
        let (db, book_id) = setup().await;
        let ledger = Ledger::new(&db);
        let now = Utc::now();

        let first = ledger.insert(1, book_id, now, None).await.unwrap();
        assert_eq!(first.status, BorrowStatus::Requested);
        assert_eq!(first.requested_at.timestamp_micros(), now.timestamp_micros());

        let err = ledger.insert(2, book_id, now, None).await.unwrap_err();
        assert!(matches!(err, BorrowError::Conflict(_)));

        let pending = ledger
            .find_active_by_book(book_id, &[BorrowStatus::Requested])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    #[tokio::test]
    async fn test_find_by_id_missing() {
        let (db, _) = setup().await;
        let err = Ledger::new(&db).find_by_id(42).await.unwrap_err();
        assert!(matches!(err, BorrowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_if_status_is_compare_and_swap() {
        let (db, book_id) = setup().await;
        let ledger = Ledger::new(&db);
        let record = ledger.insert(1, book_id, Utc::now(), None).await.unwrap();

        let mut approved = record.clone();
        approved.status = BorrowStatus::Approved;
        approved.approved_at = Some(Utc::now());

        {
            let _guard = db.write_lock().await;
            assert!(ledger.update_if_status(&approved, BorrowStatus::Requested).await.unwrap());
            assert!(!ledger.update_if_status(&approved, BorrowStatus::Requested).await.unwrap());
        }

        let stored = ledger.find_by_id(record.id).await.unwrap();
        assert_eq!(stored.status, BorrowStatus::Approved);
        assert!(stored.approved_at.is_some());
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_with_projections() {
        let (db, first_book) = setup().await;
        let second_book = db.create_book("Solaris", "Stanislaw Lem").await.unwrap().id;
        let user = db
            .create_user("Grace", "grace@example.com", crate::model::Role::User)
            .await
            .unwrap();
        let ledger = Ledger::new(&db);
        let earlier = Utc::now() - Duration::hours(1);

        ledger.insert(user.id, first_book, earlier, None).await.unwrap();
        let newest = ledger.insert(user.id, second_book, Utc::now(), None).await.unwrap();
        ledger.insert(user.id + 100, first_book, Utc::now(), None).await.unwrap_err();

        let mine = ledger.list_by_user(user.id).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].request.id, newest.id);
        assert_eq!(mine[0].book.as_ref().unwrap().title, "Solaris");
        assert_eq!(mine[1].book.as_ref().unwrap().author, "Toni Morrison");

        let all = ledger.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].request.id, newest.id);
        assert_eq!(all[0].user.as_ref().unwrap().email, "grace@example.com");
    }
}
