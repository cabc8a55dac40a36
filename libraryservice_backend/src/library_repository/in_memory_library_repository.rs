use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};

use itertools::Itertools;
use serde_json::json;

use crate::api::{
    Book, BookBorrowCount, BookDetails, BookDetailsPatch, BookId, BookSummary, BooksQuery,
    Borrow, BorrowId, BorrowsQuery, Favorite, FavoriteId, LibraryReport, Role, Timestamp,
    UserDetails, UserId, UserSummary,
};
use crate::library_repository::{LibraryRepository, LibraryRepositoryError};

struct StoredBook {
    details: BookDetails,
    available: bool,
}

#[derive(Default)]
struct LibraryTables {
    books: BTreeMap<BookId, StoredBook>,
    users: BTreeMap<UserId, UserDetails>,
    borrows: BTreeMap<BorrowId, Borrow>,
    favorites: BTreeMap<FavoriteId, Favorite>,
}

/// Keeps every table behind a single lock, so an operation touching a book and its borrows
/// is applied while holding one write guard.
pub struct InMemoryLibraryRepository {
    tables: parking_lot::RwLock<LibraryTables>,
    book_sequence_generator: AtomicI32,
    user_sequence_generator: AtomicI32,
    borrow_sequence_generator: AtomicI32,
    favorite_sequence_generator: AtomicI32,
}

impl Default for InMemoryLibraryRepository {
    fn default() -> Self {
        // ids start at 1 like SERIAL columns
        Self {
            tables: Default::default(),
            book_sequence_generator: AtomicI32::new(1),
            user_sequence_generator: AtomicI32::new(1),
            borrow_sequence_generator: AtomicI32::new(1),
            favorite_sequence_generator: AtomicI32::new(1),
        }
    }
}

fn matches_query(details: &BookDetails, available: bool, query: &BooksQuery) -> bool {
    if query.available_only && !available {
        return false;
    }
    if let Some(category) = &query.category {
        if !details.categories.iter().any(|c| c == category) {
            return false;
        }
    }
    if let Some(search) = &query.search {
        let search = search.to_lowercase();
        if !details.title.to_lowercase().contains(&search)
            && !details.author.to_lowercase().contains(&search)
        {
            return false;
        }
    }
    true
}

#[async_trait::async_trait]
impl LibraryRepository for InMemoryLibraryRepository {
    async fn add_book(&self, details: BookDetails) -> Result<BookId, LibraryRepositoryError> {
        let id = self.book_sequence_generator.fetch_add(1, Ordering::Relaxed);
        self.tables.write().books.insert(
            id,
            StoredBook {
                details,
                available: true,
            },
        );
        Ok(id)
    }

    async fn get_book(&self, book_id: BookId) -> Result<Book, LibraryRepositoryError> {
        self.tables
            .read()
            .books
            .get(&book_id)
            .map(|stored| Book {
                book_id,
                available: stored.available,
                details: stored.details.clone(),
            })
            .ok_or(LibraryRepositoryError::BookNotFound(book_id))
    }

    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<bool, LibraryRepositoryError> {
        let mut tables = self.tables.write();
        if let Some(stored) = tables.books.get_mut(&book_id) {
            let mut result_book = json!(stored.details);
            json_patch::merge(&mut result_book, &json!(patch));
            stored.details = serde_json::from_value(result_book)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_book(&self, book_id: BookId) -> Result<(), LibraryRepositoryError> {
        let mut tables = self.tables.write();
        match tables.books.get(&book_id) {
            None => return Err(LibraryRepositoryError::BookNotFound(book_id)),
            Some(stored) if !stored.available => {
                return Err(LibraryRepositoryError::BookCurrentlyBorrowed(book_id))
            }
            Some(_) => {}
        }
        tables.books.remove(&book_id);
        tables.borrows.retain(|_, borrow| borrow.book_id != book_id);
        tables.favorites.retain(|_, favorite| favorite.book_id != book_id);
        Ok(())
    }

    async fn list_books(
        &self,
        query: BooksQuery,
    ) -> Result<Vec<BookSummary>, LibraryRepositoryError> {
        Ok(self
            .tables
            .read()
            .books
            .iter()
            .filter(|(_, stored)| matches_query(&stored.details, stored.available, &query))
            .map(|(&book_id, stored)| BookSummary {
                book_id,
                title: stored.details.title.clone(),
                author: stored.details.author.clone(),
                available: stored.available,
            })
            .collect())
    }

    async fn list_categories(&self) -> Result<Vec<String>, LibraryRepositoryError> {
        let categories: BTreeSet<String> = self
            .tables
            .read()
            .books
            .values()
            .flat_map(|stored| stored.details.categories.iter().cloned())
            .collect();
        Ok(categories.into_iter().collect())
    }

    async fn add_user(&self, details: UserDetails) -> Result<UserId, LibraryRepositoryError> {
        let mut tables = self.tables.write();
        if tables.users.values().any(|user| user.email == details.email) {
            return Err(LibraryRepositoryError::EmailAlreadyRegistered(
                details.email,
            ));
        }
        let id = self.user_sequence_generator.fetch_add(1, Ordering::Relaxed);
        tables.users.insert(id, details);
        Ok(id)
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserDetails, LibraryRepositoryError> {
        self.tables
            .read()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(LibraryRepositoryError::UserNotFound(user_id))
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>, LibraryRepositoryError> {
        Ok(self
            .tables
            .read()
            .users
            .iter()
            .map(|(&user_id, details)| UserSummary {
                user_id,
                name: details.name.clone(),
                email: details.email.clone(),
                role: details.role,
            })
            .collect())
    }

    async fn set_user_role(
        &self,
        user_id: UserId,
        role: Role,
    ) -> Result<(), LibraryRepositoryError> {
        let mut tables = self.tables.write();
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(LibraryRepositoryError::UserNotFound(user_id))?;
        user.role = role;
        Ok(())
    }

    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        borrowed_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError> {
        let mut tables = self.tables.write();

        match tables.books.get(&book_id) {
            None => return Err(LibraryRepositoryError::BookNotFound(book_id)),
            Some(stored) if !stored.available => {
                return Err(LibraryRepositoryError::BookAlreadyBorrowed(book_id))
            }
            Some(_) => {}
        }
        if !tables.users.contains_key(&user_id) {
            return Err(LibraryRepositoryError::UserNotFound(user_id));
        }

        // All checks passed, both writes below happen under the same guard
        let borrow = Borrow {
            borrow_id: self.borrow_sequence_generator.fetch_add(1, Ordering::Relaxed),
            user_id,
            book_id,
            borrowed_at,
            returned_at: None,
        };
        tables.borrows.insert(borrow.borrow_id, borrow.clone());
        if let Some(stored) = tables.books.get_mut(&book_id) {
            stored.available = false;
        }
        Ok(borrow)
    }

    async fn get_borrow(&self, borrow_id: BorrowId) -> Result<Borrow, LibraryRepositoryError> {
        self.tables
            .read()
            .borrows
            .get(&borrow_id)
            .cloned()
            .ok_or(LibraryRepositoryError::BorrowNotFound(borrow_id))
    }

    async fn close_borrow(
        &self,
        borrow_id: BorrowId,
        returned_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError> {
        let mut tables = self.tables.write();

        let borrow = tables
            .borrows
            .get_mut(&borrow_id)
            .ok_or(LibraryRepositoryError::BorrowNotFound(borrow_id))?;
        if !borrow.is_active() {
            return Err(LibraryRepositoryError::BorrowAlreadyReturned(borrow_id));
        }
        borrow.returned_at = Some(returned_at);
        let closed = borrow.clone();

        if let Some(stored) = tables.books.get_mut(&closed.book_id) {
            stored.available = true;
        }
        Ok(closed)
    }

    async fn list_borrows(
        &self,
        query: BorrowsQuery,
    ) -> Result<Vec<Borrow>, LibraryRepositoryError> {
        Ok(self
            .tables
            .read()
            .borrows
            .values()
            .filter(|borrow| query.user_id.map_or(true, |uid| borrow.user_id == uid))
            .filter(|borrow| !query.active_only || borrow.is_active())
            .sorted_by(|a, b| {
                b.borrowed_at
                    .cmp(&a.borrowed_at)
                    .then(b.borrow_id.cmp(&a.borrow_id))
            })
            .cloned()
            .collect())
    }

    async fn add_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Favorite, LibraryRepositoryError> {
        let mut tables = self.tables.write();
        if !tables.books.contains_key(&book_id) {
            return Err(LibraryRepositoryError::BookNotFound(book_id));
        }
        if !tables.users.contains_key(&user_id) {
            return Err(LibraryRepositoryError::UserNotFound(user_id));
        }
        if tables
            .favorites
            .values()
            .any(|f| f.user_id == user_id && f.book_id == book_id)
        {
            return Err(LibraryRepositoryError::FavoriteAlreadyExists(book_id));
        }
        let favorite = Favorite {
            favorite_id: self.favorite_sequence_generator.fetch_add(1, Ordering::Relaxed),
            user_id,
            book_id,
        };
        tables
            .favorites
            .insert(favorite.favorite_id, favorite.clone());
        Ok(favorite)
    }

    async fn remove_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<(), LibraryRepositoryError> {
        let mut tables = self.tables.write();
        let favorite_id = tables
            .favorites
            .values()
            .find(|f| f.user_id == user_id && f.book_id == book_id)
            .map(|f| f.favorite_id)
            .ok_or(LibraryRepositoryError::FavoriteNotFound(book_id))?;
        tables.favorites.remove(&favorite_id);
        Ok(())
    }

    async fn list_favorites(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Favorite>, LibraryRepositoryError> {
        Ok(self
            .tables
            .read()
            .favorites
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn library_report(
        &self,
        top_books: usize,
    ) -> Result<LibraryReport, LibraryRepositoryError> {
        let tables = self.tables.read();

        let mut borrow_counts: HashMap<BookId, i64> = HashMap::new();
        for borrow in tables.borrows.values() {
            *borrow_counts.entry(borrow.book_id).or_default() += 1;
        }

        let most_borrowed = borrow_counts
            .into_iter()
            .filter_map(|(book_id, times_borrowed)| {
                tables.books.get(&book_id).map(|stored| BookBorrowCount {
                    book_id,
                    title: stored.details.title.clone(),
                    times_borrowed,
                })
            })
            .sorted_by(|a, b| {
                b.times_borrowed
                    .cmp(&a.times_borrowed)
                    .then(a.book_id.cmp(&b.book_id))
            })
            .take(top_books)
            .collect();

        let total_books = tables.books.len() as i64;
        let available_books = tables.books.values().filter(|b| b.available).count() as i64;

        Ok(LibraryReport {
            total_books,
            available_books,
            borrowed_books: total_books - available_books,
            total_users: tables.users.len() as i64,
            total_borrows: tables.borrows.len() as i64,
            active_borrows: tables.borrows.values().filter(|b| b.is_active()).count() as i64,
            most_borrowed,
        })
    }
}
