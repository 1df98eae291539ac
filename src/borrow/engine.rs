use chrono::{DateTime, SubsecRound, Utc};

use super::ledger::{BorrowRequest, BorrowRequestWithBook, BorrowRequestWithUserAndBook, BorrowStatus, Ledger};
use crate::config::BorrowPolicy;
use crate::db::Database;
use crate::error::{BorrowError, BorrowResult};
use crate::model::Actor;

/// A validated transition waiting to be committed.
///
/// `current` is the snapshot the checks ran against; [`BorrowEngine::commit`]
/// only applies `next` if the stored row still matches it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub current: BorrowRequest,
    pub next: BorrowRequest,
    /// Book availability flip as `(expected, next)`.
    pub availability: Option<(bool, bool)>,
}

pub struct BorrowEngine<'a> {
    db: &'a Database,
    policy: &'a BorrowPolicy,
}

impl<'a> BorrowEngine<'a> {
    pub fn new(db: &'a Database, policy: &'a BorrowPolicy) -> Self {
        Self { db, policy }
    }

    /// Stored timestamps keep microsecond precision.
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn ledger(&self) -> Ledger<'a> {
        Ledger::new(self.db)
    }

    fn require_staff(actor: &Actor, action: &str) -> BorrowResult<()> {
        if actor.role.is_staff() {
            Ok(())
        } else {
            Err(BorrowError::Forbidden(format!(
                "role {} is not allowed to {action} borrow requests",
                actor.role.as_str()
            )))
        }
    }

    fn due_date(&self, from: DateTime<Utc>) -> BorrowResult<DateTime<Utc>> {
        self.policy
            .loan_period()
            .and_then(|period| from.checked_add_signed(period))
            .ok_or_else(|| {
                BorrowError::Internal(anyhow::anyhow!(
                    "loan period of {} days overflows the due date",
                    self.policy.loan_period_days
                ))
            })
    }

    fn already(status: BorrowStatus) -> BorrowError {
        BorrowError::InvalidState(format!("Borrow request already {}", status.as_str()))
    }

    pub async fn create_borrow_request(&self, actor: Actor, book_id: i64) -> BorrowResult<BorrowRequest> {
        if !self.policy.may_borrow(actor.role) {
            return Err(BorrowError::Forbidden(format!(
                "role {} is not allowed to request books",
                actor.role.as_str()
            )));
        }

        if self.db.get_book(book_id).await?.is_none() {
            return Err(BorrowError::NotFound("Book not found".to_string()));
        }

        let now = Self::now();
        let provisional_due = self.due_date(now)?;
        let request = self
            .ledger()
            .insert(actor.id, book_id, now, Some(provisional_due))
            .await?;

        tracing::info!(
            request_id = request.id,
            book_id,
            actor_id = actor.id,
            "borrow request created"
        );
        Ok(request)
    }

    pub async fn list_user_borrow_requests(&self, actor: Actor) -> BorrowResult<Vec<BorrowRequestWithBook>> {
        self.ledger().list_by_user(actor.id).await
    }

    pub async fn list_all_borrow_requests(&self, actor: Actor) -> BorrowResult<Vec<BorrowRequestWithUserAndBook>> {
        Self::require_staff(&actor, "list all")?;
        self.ledger().list_all().await
    }

    pub async fn plan_approve(&self, actor: Actor, request_id: i64, now: DateTime<Utc>) -> BorrowResult<Transition> {
        Self::require_staff(&actor, "approve")?;
        let current = self.ledger().find_by_id(request_id).await?;

        if current.status != BorrowStatus::Requested {
            return Err(Self::already(current.status));
        }

        let book = self
            .db
            .get_book(current.book_id)
            .await?
            .ok_or_else(|| BorrowError::NotFound("Book not found".to_string()))?;
        if !book.availability {
            return Err(BorrowError::Conflict("Book is unavailable".to_string()));
        }

        let mut next = current.clone();
        next.status = BorrowStatus::Approved;
        next.approved_at = Some(now);
        next.due_date = Some(self.due_date(now)?);

        Ok(Transition {
            current,
            next,
            availability: Some((true, false)),
        })
    }

    pub async fn plan_reject(&self, actor: Actor, request_id: i64) -> BorrowResult<Transition> {
        Self::require_staff(&actor, "reject")?;
        let current = self.ledger().find_by_id(request_id).await?;

        if current.status != BorrowStatus::Requested {
            return Err(Self::already(current.status));
        }

        let mut next = current.clone();
        next.status = BorrowStatus::Rejected;

        Ok(Transition {
            current,
            next,
            availability: None,
        })
    }

    pub async fn plan_return(&self, actor: Actor, request_id: i64, now: DateTime<Utc>) -> BorrowResult<Transition> {
        let current = self.ledger().find_by_id(request_id).await?;

        if current.user_id != actor.id && !actor.role.is_staff() {
            return Err(BorrowError::Forbidden(
                "You are not authorized to return this book".to_string(),
            ));
        }

        match current.status {
            BorrowStatus::Approved => {}
            BorrowStatus::Returned => return Err(Self::already(BorrowStatus::Returned)),
            BorrowStatus::Requested | BorrowStatus::Rejected => {
                return Err(BorrowError::InvalidState("Borrow request is not approved".to_string()));
            }
        }

        let mut next = current.clone();
        next.status = BorrowStatus::Returned;
        next.returned_at = Some(now);

        Ok(Transition {
            current,
            next,
            availability: Some((false, true)),
        })
    }

    /// Applies a planned transition in one transaction. Both the status write
    /// and the availability write are conditional; losing either race rolls
    /// the pair back and reports `Conflict`.
    pub async fn commit(&self, transition: Transition) -> BorrowResult<BorrowRequest> {
        let _guard = self.db.write_lock().await;
        let conn = self.db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = self.apply(&transition).await;

        match result {
            Ok(()) => {
                if let Err(e) = conn.execute("COMMIT", ()).await {
                    if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                        tracing::error!(error = %rollback, "rollback failed");
                    }
                    return Err(e.into());
                }
            }
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                    tracing::error!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        }

        let request = transition.next;
        tracing::info!(
            request_id = request.id,
            book_id = request.book_id,
            from = transition.current.status.as_str(),
            to = request.status.as_str(),
            "borrow request transitioned"
        );
        Ok(request)
    }

    async fn apply(&self, transition: &Transition) -> BorrowResult<()> {
        let Transition {
            current,
            next,
            availability,
        } = transition;

        if !current.status.can_transition_to(next.status) {
            return Err(BorrowError::InvalidState(format!(
                "cannot move borrow request from {} to {}",
                current.status.as_str(),
                next.status.as_str()
            )));
        }

        if !self.ledger().update_if_status(next, current.status).await? {
            tracing::warn!(request_id = current.id, "borrow request changed during transition");
            return Err(BorrowError::Conflict(
                "Borrow request was modified by another operation".to_string(),
            ));
        }

        if let Some((expected, flipped)) = availability {
            if !self.db.swap_availability(current.book_id, *expected, *flipped).await? {
                tracing::warn!(book_id = current.book_id, "book availability changed during transition");
                let msg = if *expected {
                    "Book is unavailable"
                } else {
                    "Book availability is out of sync with its loan"
                };
                return Err(BorrowError::Conflict(msg.to_string()));
            }
        }

        Ok(())
    }

    pub async fn approve_borrow_request(&self, actor: Actor, request_id: i64) -> BorrowResult<BorrowRequest> {
        let transition = self.plan_approve(actor, request_id, Self::now()).await?;
        self.commit(transition).await
    }

    pub async fn reject_borrow_request(&self, actor: Actor, request_id: i64) -> BorrowResult<BorrowRequest> {
        let transition = self.plan_reject(actor, request_id).await?;
        self.commit(transition).await
    }

    pub async fn return_borrow_request(&self, actor: Actor, request_id: i64) -> BorrowResult<BorrowRequest> {
        let transition = self.plan_return(actor, request_id, Self::now()).await?;
        self.commit(transition).await
    }
}
