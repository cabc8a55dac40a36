use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::api::{BookId, Borrow, BorrowId, Caller, Timestamp};
use crate::errors::LibraryError;
use crate::library_repository::LibraryRepository;

pub fn now_timestamp() -> Result<Timestamp, LibraryError> {
    timestamp_of(SystemTime::now())
}

/// Fails instead of stamping a borrow with a time before the epoch
fn timestamp_of(time: SystemTime) -> Result<Timestamp, LibraryError> {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as Timestamp)
        .map_err(|err| {
            tracing::error!("System clock is before the Unix epoch: {}", err);
            LibraryError::StoreFailure(format!("Clock before the Unix epoch: {}", err))
        })
}

/// Moves borrows through ACTIVE -> RETURNED while keeping the availability flag of the book in
/// line with them. Serialization of concurrent calls is left to the store, nothing is locked here.
#[derive(Clone)]
pub struct BorrowLifecycle {
    repository: Arc<dyn LibraryRepository>,
}

impl BorrowLifecycle {
    pub fn new(repository: Arc<dyn LibraryRepository>) -> Self {
        Self { repository }
    }

    /// Lends an available book to the caller
    pub async fn borrow_book(
        &self,
        book_id: BookId,
        caller: Option<Caller>,
    ) -> Result<Borrow, LibraryError> {
        let caller = caller.ok_or(LibraryError::Unauthorized)?;
        let borrowed_at = now_timestamp()?;

        match self
            .repository
            .create_borrow(caller.user_id, book_id, borrowed_at)
            .await
        {
            Ok(borrow) => {
                tracing::info!(
                    "Book {} borrowed by user {}, borrow {}",
                    book_id,
                    caller.user_id,
                    borrow.borrow_id
                );
                Ok(borrow)
            }
            Err(err) => {
                tracing::warn!(
                    "User {} failed to borrow book {}: {}",
                    caller.user_id,
                    book_id,
                    err
                );
                Err(err.into())
            }
        }
    }

    /// Closes an active borrow. Allowed for the borrowing user and for admins.
    /// A caller who may not return the borrow gets Forbidden even if it is already returned.
    pub async fn return_book(
        &self,
        borrow_id: BorrowId,
        caller: Option<Caller>,
    ) -> Result<Borrow, LibraryError> {
        let caller = caller.ok_or(LibraryError::Unauthorized)?;

        let borrow = self.repository.get_borrow(borrow_id).await?;
        if !caller.can_act_for(borrow.user_id) {
            tracing::warn!(
                "User {} tried to return borrow {} of user {}",
                caller.user_id,
                borrow_id,
                borrow.user_id
            );
            return Err(LibraryError::NotYourBorrow(borrow_id));
        }
        if !borrow.is_active() {
            return Err(LibraryError::BorrowAlreadyReturned(borrow_id));
        }

        // The store re-checks the state, a concurrent return still ends up as a conflict
        let returned = self
            .repository
            .close_borrow(borrow_id, now_timestamp()?)
            .await?;
        tracing::info!(
            "Book {} returned by user {}, borrow {}",
            returned.book_id,
            caller.user_id,
            borrow_id
        );
        Ok(returned)
    }
}
