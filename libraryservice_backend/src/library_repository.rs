pub use in_memory_library_repository::InMemoryLibraryRepository;
pub use postgres_library_repository::{
    PostgresLibraryRepository, PostgresLibraryRepositoryConfig,
};

use crate::api::{
    Book, BookDetails, BookDetailsPatch, BookId, BookSummary, BooksQuery, Borrow, BorrowId,
    BorrowsQuery, Favorite, LibraryReport, Role, Timestamp, UserDetails, UserId, UserSummary,
};

mod in_memory_library_repository;
mod postgres_library_repository;

#[derive(Debug, thiserror::Error)]
pub enum LibraryRepositoryError {
    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Borrow {0} not found")]
    BorrowNotFound(BorrowId),

    #[error("Book {0} is already borrowed")]
    BookAlreadyBorrowed(BookId),

    #[error("Book {0} is currently borrowed")]
    BookCurrentlyBorrowed(BookId),

    #[error("Borrow {0} was already returned")]
    BorrowAlreadyReturned(BorrowId),

    #[error("Book {0} is already a favorite")]
    FavoriteAlreadyExists(BookId),

    #[error("Book {0} is not a favorite")]
    FavoriteNotFound(BookId),

    #[error("Email {0} is already registered")]
    EmailAlreadyRegistered(String),

    #[error("Failed to deserialize record: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Database failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

/// Persistent store of the library.
///
/// `create_borrow` and `close_borrow` are the only operations that write the availability flag
/// of a book, and each of them applies its two writes as one atomic unit.
#[async_trait::async_trait]
pub trait LibraryRepository: Send + Sync {
    /// Adds book to repository, new books are available. Returns an id assigned to the book
    async fn add_book(&self, details: BookDetails) -> Result<BookId, LibraryRepositoryError>;

    async fn get_book(&self, book_id: BookId) -> Result<Book, LibraryRepositoryError>;

    /// Updates book details, returns true if book was updated and false if it was not found
    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<bool, LibraryRepositoryError>;

    /// Removes a book that is not borrowed, together with its favorites and borrow history
    async fn delete_book(&self, book_id: BookId) -> Result<(), LibraryRepositoryError>;

    /// Lists books matching the query, ordered by id
    async fn list_books(&self, query: BooksQuery)
        -> Result<Vec<BookSummary>, LibraryRepositoryError>;

    /// Lists distinct categories of all books, sorted
    async fn list_categories(&self) -> Result<Vec<String>, LibraryRepositoryError>;

    async fn add_user(&self, details: UserDetails) -> Result<UserId, LibraryRepositoryError>;

    async fn get_user(&self, user_id: UserId) -> Result<UserDetails, LibraryRepositoryError>;

    async fn list_users(&self) -> Result<Vec<UserSummary>, LibraryRepositoryError>;

    async fn set_user_role(&self, user_id: UserId, role: Role)
        -> Result<(), LibraryRepositoryError>;

    /// Atomically creates an active borrow and marks the book as not available.
    /// Fails with BookAlreadyBorrowed if the book is not available, nothing is written then.
    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        borrowed_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError>;

    async fn get_borrow(&self, borrow_id: BorrowId) -> Result<Borrow, LibraryRepositoryError>;

    /// Atomically sets the return timestamp of an active borrow and marks the book as available.
    /// Fails with BorrowAlreadyReturned if the borrow is not active, nothing is written then.
    async fn close_borrow(
        &self,
        borrow_id: BorrowId,
        returned_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError>;

    /// Lists borrows matching the query, newest first
    async fn list_borrows(&self, query: BorrowsQuery) -> Result<Vec<Borrow>, LibraryRepositoryError>;

    async fn add_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Favorite, LibraryRepositoryError>;

    async fn remove_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<(), LibraryRepositoryError>;

    async fn list_favorites(&self, user_id: UserId)
        -> Result<Vec<Favorite>, LibraryRepositoryError>;

    /// Summary counters and the `top_books` most borrowed books
    async fn library_report(&self, top_books: usize)
        -> Result<LibraryReport, LibraryRepositoryError>;
}
