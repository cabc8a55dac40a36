use std::fmt;
use std::str::FromStr;

use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Deserializer, Serialize};

pub type BookId = i32;
pub type UserId = i32;
pub type BorrowId = i32;
pub type FavoriteId = i32;
/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Header carrying the id of the authenticated caller, set by the identity provider
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the role of the authenticated caller, set by the identity provider
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash, Apiv2Schema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("Unknown role {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    /// Role names are compared case-insensitively, "ADMIN" and "admin" are the same role
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownRole(value.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of the authenticated caller of a request
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// True if caller is the given user or an admin
    pub fn can_act_for(&self, user_id: UserId) -> bool {
        self.user_id == user_id || self.is_admin()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(deny_unknown_fields)]
/// Struct representing details of the book
pub struct BookDetails {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub publication_year: Option<i32>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(deny_unknown_fields)]
/// Patch to book details. Only the provided fields are changed.
/// Optional details are cleared with an explicit null (`Some(None)`),
/// null for title, author or categories leaves them unchanged.
/// Availability is not part of the patch, it is owned by the borrow lifecycle.
pub struct BookDetailsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub publication_year: Option<Option<i32>>,
    #[serde(
        default,
        deserialize_with = "deserialize_nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub cover_image: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
}

/// Missing field gives None, explicit null gives Some(None)
fn deserialize_nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct Book {
    pub book_id: BookId,
    pub available: bool,
    pub details: BookDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// Short form of the book used in listings
pub struct BookSummary {
    pub book_id: BookId,
    pub title: String,
    pub author: String,
    pub available: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BooksQuery {
    /// Only books with this category
    pub category: Option<String>,
    /// Case insensitive match against title or author
    pub search: Option<String>,
    /// Only books that can be borrowed right now
    #[serde(default)]
    pub available_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct GetAllBooksResponse {
    pub books: Vec<BookSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserDetails {
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(deny_unknown_fields)]
/// Registration payload, registered users always get the user role
pub struct NewUser {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl From<NewUser> for UserDetails {
    fn from(new_user: NewUser) -> Self {
        Self {
            name: new_user.name,
            email: new_user.email,
            role: Role::User,
            profile_image: new_user.profile_image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserSummary {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(deny_unknown_fields)]
pub struct RoleUpdate {
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "lowercase")]
pub enum BorrowState {
    Active,
    Returned,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// One loan of a book to a user, active until returned_at is set
pub struct Borrow {
    pub borrow_id: BorrowId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub borrowed_at: Timestamp,
    pub returned_at: Option<Timestamp>,
}

impl Borrow {
    pub fn state(&self) -> BorrowState {
        match self.returned_at {
            None => BorrowState::Active,
            Some(_) => BorrowState::Returned,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == BorrowState::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(deny_unknown_fields)]
pub struct BorrowRequest {
    pub book_id: BookId,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BorrowsQuery {
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct MyBorrowsQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct Favorite {
    pub favorite_id: FavoriteId,
    pub user_id: UserId,
    pub book_id: BookId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookBorrowCount {
    pub book_id: BookId,
    pub title: String,
    pub times_borrowed: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// Snapshot of the library state for the admin panel
pub struct LibraryReport {
    pub total_books: i64,
    pub available_books: i64,
    pub borrowed_books: i64,
    pub total_users: i64,
    pub total_borrows: i64,
    pub active_borrows: i64,
    /// Most borrowed books, most popular first
    pub most_borrowed: Vec<BookBorrowCount>,
}

/// Outcome kinds of a rejected request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Forbidden,
    Unauthorized,
    /// Nothing was applied, the request can be repeated
    StoreFailure,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Forbidden => 403,
            ErrorKind::Unauthorized => 401,
            ErrorKind::StoreFailure => 503,
        }
    }

    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            404 => Some(ErrorKind::NotFound),
            409 => Some(ErrorKind::Conflict),
            403 => Some(ErrorKind::Forbidden),
            401 => Some(ErrorKind::Unauthorized),
            503 => Some(ErrorKind::StoreFailure),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        *self == ErrorKind::StoreFailure
    }
}

/// Request rejected by the service, with the message shown to the user
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
}
