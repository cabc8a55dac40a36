use std::sync::Arc;

use crate::api::{
    Book, BookDetails, BookDetailsPatch, BookId, BookSummary, BooksQuery, Borrow, BorrowId,
    BorrowsQuery, Caller, Favorite, LibraryReport, NewUser, Role, UserDetails, UserId,
    UserSummary,
};
use crate::borrow_lifecycle::BorrowLifecycle;
use crate::errors::LibraryError;
use crate::library_repository::LibraryRepository;

fn authenticated(caller: Option<Caller>) -> Result<Caller, LibraryError> {
    caller.ok_or(LibraryError::Unauthorized)
}

fn admin(caller: Option<Caller>) -> Result<Caller, LibraryError> {
    let caller = authenticated(caller)?;
    if caller.is_admin() {
        Ok(caller)
    } else {
        Err(LibraryError::AdminRequired)
    }
}

/// Operations behind the HTTP routes. Catalog, users, favorites and reports are thin
/// checks around the repository, borrowing goes through the borrow lifecycle.
#[derive(Clone)]
pub struct LibraryService {
    repository: Arc<dyn LibraryRepository>,
    borrow_lifecycle: BorrowLifecycle,
    report_top_books: usize,
}

impl LibraryService {
    pub fn new(repository: Arc<dyn LibraryRepository>, report_top_books: usize) -> Self {
        Self {
            borrow_lifecycle: BorrowLifecycle::new(repository.clone()),
            repository,
            report_top_books,
        }
    }

    pub async fn list_books(&self, query: BooksQuery) -> Result<Vec<BookSummary>, LibraryError> {
        Ok(self.repository.list_books(query).await?)
    }

    pub async fn list_categories(&self) -> Result<Vec<String>, LibraryError> {
        Ok(self.repository.list_categories().await?)
    }

    pub async fn get_book(&self, book_id: BookId) -> Result<Book, LibraryError> {
        Ok(self.repository.get_book(book_id).await?)
    }

    pub async fn add_book(
        &self,
        caller: Option<Caller>,
        details: BookDetails,
    ) -> Result<BookId, LibraryError> {
        admin(caller)?;
        let book_id = self.repository.add_book(details).await?;
        tracing::info!("Book {} added to catalog", book_id);
        Ok(book_id)
    }

    pub async fn update_book(
        &self,
        caller: Option<Caller>,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<(), LibraryError> {
        admin(caller)?;
        if self.repository.update_book(book_id, patch).await? {
            Ok(())
        } else {
            Err(LibraryError::BookNotFound(book_id))
        }
    }

    pub async fn delete_book(
        &self,
        caller: Option<Caller>,
        book_id: BookId,
    ) -> Result<(), LibraryError> {
        admin(caller)?;
        self.repository.delete_book(book_id).await?;
        tracing::info!("Book {} removed from catalog", book_id);
        Ok(())
    }

    /// Registered users always start with the user role
    pub async fn register_user(&self, new_user: NewUser) -> Result<UserId, LibraryError> {
        let user_id = self
            .repository
            .add_user(UserDetails::from(new_user))
            .await?;
        tracing::info!("User {} registered", user_id);
        Ok(user_id)
    }

    pub async fn get_user(
        &self,
        caller: Option<Caller>,
        user_id: UserId,
    ) -> Result<UserDetails, LibraryError> {
        let caller = authenticated(caller)?;
        if !caller.can_act_for(user_id) {
            return Err(LibraryError::NotYourAccount(user_id));
        }
        Ok(self.repository.get_user(user_id).await?)
    }

    pub async fn list_users(&self, caller: Option<Caller>) -> Result<Vec<UserSummary>, LibraryError> {
        admin(caller)?;
        Ok(self.repository.list_users().await?)
    }

    pub async fn set_user_role(
        &self,
        caller: Option<Caller>,
        user_id: UserId,
        role: Role,
    ) -> Result<(), LibraryError> {
        let caller = admin(caller)?;
        self.repository.set_user_role(user_id, role).await?;
        tracing::info!(
            "User {} got role {} from admin {}",
            user_id,
            role,
            caller.user_id
        );
        Ok(())
    }

    pub async fn borrow_book(
        &self,
        caller: Option<Caller>,
        book_id: BookId,
    ) -> Result<Borrow, LibraryError> {
        self.borrow_lifecycle.borrow_book(book_id, caller).await
    }

    pub async fn return_book(
        &self,
        caller: Option<Caller>,
        borrow_id: BorrowId,
    ) -> Result<Borrow, LibraryError> {
        self.borrow_lifecycle.return_book(borrow_id, caller).await
    }

    pub async fn get_borrow(
        &self,
        caller: Option<Caller>,
        borrow_id: BorrowId,
    ) -> Result<Borrow, LibraryError> {
        let caller = authenticated(caller)?;
        let borrow = self.repository.get_borrow(borrow_id).await?;
        if caller.can_act_for(borrow.user_id) {
            Ok(borrow)
        } else {
            Err(LibraryError::NotYourBorrow(borrow_id))
        }
    }

    pub async fn list_my_borrows(
        &self,
        caller: Option<Caller>,
        active_only: bool,
    ) -> Result<Vec<Borrow>, LibraryError> {
        let caller = authenticated(caller)?;
        Ok(self
            .repository
            .list_borrows(BorrowsQuery {
                user_id: Some(caller.user_id),
                active_only,
            })
            .await?)
    }

    pub async fn list_all_borrows(
        &self,
        caller: Option<Caller>,
        query: BorrowsQuery,
    ) -> Result<Vec<Borrow>, LibraryError> {
        admin(caller)?;
        Ok(self.repository.list_borrows(query).await?)
    }

    pub async fn add_favorite(
        &self,
        caller: Option<Caller>,
        book_id: BookId,
    ) -> Result<Favorite, LibraryError> {
        let caller = authenticated(caller)?;
        Ok(self
            .repository
            .add_favorite(caller.user_id, book_id)
            .await?)
    }

    pub async fn remove_favorite(
        &self,
        caller: Option<Caller>,
        book_id: BookId,
    ) -> Result<(), LibraryError> {
        let caller = authenticated(caller)?;
        Ok(self
            .repository
            .remove_favorite(caller.user_id, book_id)
            .await?)
    }

    pub async fn list_favorites(
        &self,
        caller: Option<Caller>,
    ) -> Result<Vec<Favorite>, LibraryError> {
        let caller = authenticated(caller)?;
        Ok(self.repository.list_favorites(caller.user_id).await?)
    }

    pub async fn library_report(
        &self,
        caller: Option<Caller>,
    ) -> Result<LibraryReport, LibraryError> {
        admin(caller)?;
        Ok(self
            .repository
            .library_report(self.report_top_books)
            .await?)
    }
}
