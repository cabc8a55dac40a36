use crate::api::{BookId, BorrowId, ErrorKind, UserId};
use crate::library_repository::LibraryRepositoryError;

/// Outcome of a rejected library operation. Every variant has its own message for the user.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Book {0} does not exist")]
    BookNotFound(BookId),

    #[error("User {0} does not exist")]
    UserNotFound(UserId),

    #[error("Borrow {0} does not exist")]
    BorrowNotFound(BorrowId),

    #[error("Book {0} is not in favorites")]
    FavoriteNotFound(BookId),

    #[error("Book {0} is already borrowed")]
    BookAlreadyBorrowed(BookId),

    #[error("Borrow {0} was already returned")]
    BorrowAlreadyReturned(BorrowId),

    #[error("Book {0} cannot be removed while it is borrowed")]
    BookCurrentlyBorrowed(BookId),

    #[error("Book {0} is already in favorites")]
    FavoriteAlreadyExists(BookId),

    #[error("Email {0} is already registered")]
    EmailAlreadyRegistered(String),

    #[error("Borrow {0} belongs to another user and cannot be returned by you")]
    NotYourBorrow(BorrowId),

    #[error("Only user {0} or an admin can access this account")]
    NotYourAccount(UserId),

    #[error("Admin role is required")]
    AdminRequired,

    #[error("Sign in to continue")]
    Unauthorized,

    #[error("Library storage is unavailable, nothing was changed, try again")]
    StoreFailure(String),
}

impl LibraryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LibraryError::BookNotFound(_)
            | LibraryError::UserNotFound(_)
            | LibraryError::BorrowNotFound(_)
            | LibraryError::FavoriteNotFound(_) => ErrorKind::NotFound,
            LibraryError::BookAlreadyBorrowed(_)
            | LibraryError::BorrowAlreadyReturned(_)
            | LibraryError::BookCurrentlyBorrowed(_)
            | LibraryError::FavoriteAlreadyExists(_)
            | LibraryError::EmailAlreadyRegistered(_) => ErrorKind::Conflict,
            LibraryError::NotYourBorrow(_)
            | LibraryError::NotYourAccount(_)
            | LibraryError::AdminRequired => ErrorKind::Forbidden,
            LibraryError::Unauthorized => ErrorKind::Unauthorized,
            LibraryError::StoreFailure(_) => ErrorKind::StoreFailure,
        }
    }
}

impl From<LibraryRepositoryError> for LibraryError {
    fn from(err: LibraryRepositoryError) -> Self {
        match err {
            LibraryRepositoryError::BookNotFound(id) => LibraryError::BookNotFound(id),
            LibraryRepositoryError::UserNotFound(id) => LibraryError::UserNotFound(id),
            LibraryRepositoryError::BorrowNotFound(id) => LibraryError::BorrowNotFound(id),
            LibraryRepositoryError::BookAlreadyBorrowed(id) => {
                LibraryError::BookAlreadyBorrowed(id)
            }
            LibraryRepositoryError::BookCurrentlyBorrowed(id) => {
                LibraryError::BookCurrentlyBorrowed(id)
            }
            LibraryRepositoryError::BorrowAlreadyReturned(id) => {
                LibraryError::BorrowAlreadyReturned(id)
            }
            LibraryRepositoryError::FavoriteAlreadyExists(id) => {
                LibraryError::FavoriteAlreadyExists(id)
            }
            LibraryRepositoryError::FavoriteNotFound(id) => LibraryError::FavoriteNotFound(id),
            LibraryRepositoryError::EmailAlreadyRegistered(email) => {
                LibraryError::EmailAlreadyRegistered(email)
            }
            other @ (LibraryRepositoryError::DeserializationError(_)
            | LibraryRepositoryError::DatabaseFailure(_)
            | LibraryRepositoryError::Other(_)) => LibraryError::StoreFailure(other.to_string()),
        }
    }
}
