use anyhow::Context;
use serde_json::json;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::api::{
    Book, BookBorrowCount, BookDetails, BookDetailsPatch, BookId, BookSummary, BooksQuery,
    Borrow, BorrowId, BorrowsQuery, Favorite, LibraryReport, Role, Timestamp, UserDetails,
    UserId, UserSummary,
};
use crate::library_repository::{LibraryRepository, LibraryRepositoryError};

pub struct PostgresLibraryRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresLibraryRepository {
    client: Client,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              SERIAL PRIMARY KEY,
    params          JSONB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS users_email_unique ON users ((params->>'email'));

CREATE TABLE IF NOT EXISTS books (
    id              SERIAL PRIMARY KEY,
    params          JSONB NOT NULL,
    available       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS borrows (
    id              SERIAL PRIMARY KEY,
    user_id         INTEGER NOT NULL REFERENCES users (id),
    book_id         INTEGER NOT NULL REFERENCES books (id) ON DELETE CASCADE,
    borrowed_at     BIGINT NOT NULL,
    returned_at     BIGINT
);
CREATE UNIQUE INDEX IF NOT EXISTS borrows_one_active_per_book
    ON borrows (book_id) WHERE returned_at IS NULL;

CREATE TABLE IF NOT EXISTS favorites (
    id              SERIAL PRIMARY KEY,
    user_id         INTEGER NOT NULL REFERENCES users (id),
    book_id         INTEGER NOT NULL REFERENCES books (id) ON DELETE CASCADE,
    UNIQUE (user_id, book_id)
);
";

impl PostgresLibraryRepository {
    pub async fn init(config: PostgresLibraryRepositoryConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        tracing::info!(
            "Postgres connecting to {} as {}",
            config.hostname,
            config.username
        );
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Postgres connection error: {}", e);
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .context("Failed to setup library tables")?;

        Ok(Self { client })
    }

    async fn book_exists(&self, book_id: BookId) -> Result<bool, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id FROM books WHERE id = $1")
            .await?;
        Ok(!self.client.query(&stmt, &[&book_id]).await?.is_empty())
    }
}

fn sql_state(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.as_db_error().map(|db_err| db_err.code())
}

fn violated_constraint(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().and_then(|db_err| db_err.constraint())
}

fn row_to_borrow(row: &Row) -> Result<Borrow, LibraryRepositoryError> {
    Ok(Borrow {
        borrow_id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        book_id: row.try_get(2)?,
        borrowed_at: row.try_get(3)?,
        returned_at: row.try_get(4)?,
    })
}

/// Turns user input into an ILIKE pattern matching it as a plain substring
fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait::async_trait]
impl LibraryRepository for PostgresLibraryRepository {
    async fn add_book(&self, details: BookDetails) -> Result<BookId, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO books (params) VALUES ($1) RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&json!(details)]).await?;

        let book_id: BookId = rows
            .first()
            .ok_or_else(|| LibraryRepositoryError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(book_id)
    }

    async fn get_book(&self, book_id: BookId) -> Result<Book, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT params, available FROM books WHERE id = $1")
            .await?;

        let rows = self.client.query(&stmt, &[&book_id]).await?;
        let row = rows
            .first()
            .ok_or(LibraryRepositoryError::BookNotFound(book_id))?;

        let details: serde_json::Value = row.try_get(0)?;
        Ok(Book {
            book_id,
            available: row.try_get(1)?,
            details: serde_json::from_value(details)?,
        })
    }

    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<bool, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("UPDATE books SET params = params || ($1)::JSONB WHERE id = ($2) RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&json!(patch), &book_id]).await?;
        Ok(!rows.is_empty())
    }

    async fn delete_book(&self, book_id: BookId) -> Result<(), LibraryRepositoryError> {
        // Favorites and borrow history go along through ON DELETE CASCADE
        let stmt: Statement = self
            .client
            .prepare("DELETE FROM books WHERE id = $1 AND available RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&book_id]).await?;
        if !rows.is_empty() {
            Ok(())
        } else if self.book_exists(book_id).await? {
            Err(LibraryRepositoryError::BookCurrentlyBorrowed(book_id))
        } else {
            Err(LibraryRepositoryError::BookNotFound(book_id))
        }
    }

    async fn list_books(
        &self,
        query: BooksQuery,
    ) -> Result<Vec<BookSummary>, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT id, params->>'title', params->>'author', available FROM books
                WHERE ($1::TEXT IS NULL OR params->'categories' ? $1::TEXT)
                  AND ($2::TEXT IS NULL OR params->>'title' ILIKE $2::TEXT OR params->>'author' ILIKE $2::TEXT)
                  AND (NOT $3::BOOLEAN OR available)
                ORDER BY id",
            )
            .await?;

        let search_pattern = query.search.as_deref().map(like_pattern);
        let rows = self
            .client
            .query(
                &stmt,
                &[&query.category, &search_pattern, &query.available_only],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(BookSummary {
                    book_id: row.try_get(0)?,
                    title: row.try_get(1)?,
                    author: row.try_get(2)?,
                    available: row.try_get(3)?,
                })
            })
            .collect()
    }

    async fn list_categories(&self) -> Result<Vec<String>, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT DISTINCT category
                FROM books, jsonb_array_elements_text(books.params->'categories') AS category
                ORDER BY category",
            )
            .await?;
        let rows = self.client.query(&stmt, &[]).await?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    async fn add_user(&self, details: UserDetails) -> Result<UserId, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO users (params) VALUES ($1) RETURNING id")
            .await?;

        let rows = match self.client.query(&stmt, &[&json!(details)]).await {
            Ok(rows) => rows,
            Err(err) if sql_state(&err) == Some(&SqlState::UNIQUE_VIOLATION) => {
                return Err(LibraryRepositoryError::EmailAlreadyRegistered(
                    details.email,
                ))
            }
            Err(other_err) => return Err(other_err.into()),
        };

        let user_id: UserId = rows
            .first()
            .ok_or_else(|| LibraryRepositoryError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(user_id)
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserDetails, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT params FROM users WHERE id = ($1)")
            .await?;

        let rows = self.client.query(&stmt, &[&user_id]).await?;

        let details: serde_json::Value = rows
            .first()
            .ok_or(LibraryRepositoryError::UserNotFound(user_id))?
            .try_get(0)?;

        Ok(serde_json::from_value(details)?)
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id, params FROM users ORDER BY id")
            .await?;
        let rows = self.client.query(&stmt, &[]).await?;

        rows.iter()
            .map(|row| {
                let user_id = row.try_get(0)?;
                let details: UserDetails = serde_json::from_value(row.try_get(1)?)?;
                Ok(UserSummary {
                    user_id,
                    name: details.name,
                    email: details.email,
                    role: details.role,
                })
            })
            .collect()
    }

    async fn set_user_role(
        &self,
        user_id: UserId,
        role: Role,
    ) -> Result<(), LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "UPDATE users SET params = jsonb_set(params, '{role}', to_jsonb($1::TEXT))
                WHERE id = $2 RETURNING id",
            )
            .await?;

        let rows = self
            .client
            .query(&stmt, &[&role.as_str(), &user_id])
            .await?;
        if rows.is_empty() {
            Err(LibraryRepositoryError::UserNotFound(user_id))
        } else {
            Ok(())
        }
    }

    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        borrowed_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError> {
        // Single statement, so claiming the book and inserting the borrow commit together.
        // A concurrent borrower blocks on the book row and then sees available = false.
        let stmt: Statement = self
            .client
            .prepare(
                "WITH claimed AS (
                    UPDATE books SET available = FALSE
                    WHERE id = $2::INTEGER AND available
                    RETURNING id
                )
                INSERT INTO borrows (user_id, book_id, borrowed_at)
                SELECT $1::INTEGER, id, $3::BIGINT FROM claimed
                RETURNING id, user_id, book_id, borrowed_at, returned_at",
            )
            .await?;

        let rows = match self
            .client
            .query(&stmt, &[&user_id, &book_id, &borrowed_at])
            .await
        {
            Ok(rows) => rows,
            Err(err) if sql_state(&err) == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                return Err(LibraryRepositoryError::UserNotFound(user_id))
            }
            Err(err) if sql_state(&err) == Some(&SqlState::UNIQUE_VIOLATION) => {
                return Err(LibraryRepositoryError::BookAlreadyBorrowed(book_id))
            }
            Err(other_err) => return Err(other_err.into()),
        };

        match rows.first() {
            Some(row) => row_to_borrow(row),
            None if self.book_exists(book_id).await? => {
                Err(LibraryRepositoryError::BookAlreadyBorrowed(book_id))
            }
            None => Err(LibraryRepositoryError::BookNotFound(book_id)),
        }
    }

    async fn get_borrow(&self, borrow_id: BorrowId) -> Result<Borrow, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT id, user_id, book_id, borrowed_at, returned_at FROM borrows WHERE id = $1",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&borrow_id]).await?;
        row_to_borrow(
            rows.first()
                .ok_or(LibraryRepositoryError::BorrowNotFound(borrow_id))?,
        )
    }

    async fn close_borrow(
        &self,
        borrow_id: BorrowId,
        returned_at: Timestamp,
    ) -> Result<Borrow, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "WITH closed AS (
                    UPDATE borrows SET returned_at = $2::BIGINT
                    WHERE id = $1::INTEGER AND returned_at IS NULL
                    RETURNING id, user_id, book_id, borrowed_at, returned_at
                ), released AS (
                    UPDATE books SET available = TRUE
                    WHERE id IN (SELECT book_id FROM closed)
                )
                SELECT id, user_id, book_id, borrowed_at, returned_at FROM closed",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&borrow_id, &returned_at]).await?;

        match rows.first() {
            Some(row) => row_to_borrow(row),
            None => {
                // Either missing or closed by someone else, get_borrow tells which
                let borrow = self.get_borrow(borrow_id).await?;
                tracing::warn!("Borrow {} already returned at {:?}", borrow_id, borrow.returned_at);
                Err(LibraryRepositoryError::BorrowAlreadyReturned(borrow_id))
            }
        }
    }

    async fn list_borrows(
        &self,
        query: BorrowsQuery,
    ) -> Result<Vec<Borrow>, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT id, user_id, book_id, borrowed_at, returned_at FROM borrows
                WHERE ($1::INTEGER IS NULL OR user_id = $1::INTEGER)
                  AND (NOT $2::BOOLEAN OR returned_at IS NULL)
                ORDER BY borrowed_at DESC, id DESC",
            )
            .await?;

        let rows = self
            .client
            .query(&stmt, &[&query.user_id, &query.active_only])
            .await?;
        rows.iter().map(row_to_borrow).collect()
    }

    async fn add_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Favorite, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO favorites (user_id, book_id) VALUES ($1, $2) RETURNING id")
            .await?;

        let rows = match self.client.query(&stmt, &[&user_id, &book_id]).await {
            Ok(rows) => rows,
            Err(err) if sql_state(&err) == Some(&SqlState::UNIQUE_VIOLATION) => {
                return Err(LibraryRepositoryError::FavoriteAlreadyExists(book_id))
            }
            Err(err) if sql_state(&err) == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                return Err(
                    if violated_constraint(&err) == Some("favorites_book_id_fkey") {
                        LibraryRepositoryError::BookNotFound(book_id)
                    } else {
                        LibraryRepositoryError::UserNotFound(user_id)
                    },
                )
            }
            Err(other_err) => return Err(other_err.into()),
        };

        let favorite_id = rows
            .first()
            .ok_or_else(|| LibraryRepositoryError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(Favorite {
            favorite_id,
            user_id,
            book_id,
        })
    }

    async fn remove_favorite(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<(), LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("DELETE FROM favorites WHERE user_id = $1 AND book_id = $2 RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&user_id, &book_id]).await?;
        if rows.is_empty() {
            Err(LibraryRepositoryError::FavoriteNotFound(book_id))
        } else {
            Ok(())
        }
    }

    async fn list_favorites(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Favorite>, LibraryRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id, user_id, book_id FROM favorites WHERE user_id = $1 ORDER BY id")
            .await?;

        let rows = self.client.query(&stmt, &[&user_id]).await?;
        rows.iter()
            .map(|row| {
                Ok(Favorite {
                    favorite_id: row.try_get(0)?,
                    user_id: row.try_get(1)?,
                    book_id: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn library_report(
        &self,
        top_books: usize,
    ) -> Result<LibraryReport, LibraryRepositoryError> {
        let counters_stmt: Statement = self
            .client
            .prepare(
                "SELECT
                    (SELECT COUNT(*) FROM books),
                    (SELECT COUNT(*) FROM books WHERE available),
                    (SELECT COUNT(*) FROM users),
                    (SELECT COUNT(*) FROM borrows),
                    (SELECT COUNT(*) FROM borrows WHERE returned_at IS NULL)",
            )
            .await?;
        let counters = self.client.query_one(&counters_stmt, &[]).await?;

        let top_stmt: Statement = self
            .client
            .prepare(
                "SELECT borrows.book_id, books.params->>'title', COUNT(*) AS times_borrowed
                FROM borrows JOIN books ON books.id = borrows.book_id
                GROUP BY borrows.book_id, books.params->>'title'
                ORDER BY times_borrowed DESC, borrows.book_id
                LIMIT $1",
            )
            .await?;
        let limit = i64::try_from(top_books).unwrap_or(i64::MAX);
        let top_rows = self.client.query(&top_stmt, &[&limit]).await?;

        let most_borrowed = top_rows
            .iter()
            .map(|row| {
                Ok(BookBorrowCount {
                    book_id: row.try_get(0)?,
                    title: row.try_get(1)?,
                    times_borrowed: row.try_get(2)?,
                })
            })
            .collect::<Result<Vec<_>, LibraryRepositoryError>>()?;

        let total_books: i64 = counters.try_get(0)?;
        let available_books: i64 = counters.try_get(1)?;

        Ok(LibraryReport {
            total_books,
            available_books,
            borrowed_books: total_books - available_books,
            total_users: counters.try_get(2)?,
            total_borrows: counters.try_get(3)?,
            active_borrows: counters.try_get(4)?,
            most_borrowed,
        })
    }
}
