use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::header::LOCATION;
use reqwest::{Method, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{Retryable, RetryableStrategy, RetryTransientMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::de::DeserializeOwned;

use crate::api::{
    Book, BookDetails, BookDetailsPatch, BookId, BookSummary, BooksQuery, Borrow, BorrowId,
    BorrowRequest, BorrowsQuery, Caller, ErrorKind, Favorite, GetAllBooksResponse, LibraryReport,
    MyBorrowsQuery, NewUser, Rejection, Role, RoleUpdate, UserDetails, UserId, UserSummary,
    USER_ID_HEADER, USER_ROLE_HEADER,
};

/// Repeats only requests rejected with a store failure, nothing was applied for those.
/// Transport errors are final, the request may already be committed.
struct RetryStoreFailures;

impl RetryableStrategy for RetryStoreFailures {
    fn handle(&self, res: &Result<Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                Some(Retryable::Transient)
            }
            Ok(_) => None,
            Err(_) => Some(Retryable::Fatal),
        }
    }
}

/// Outer error is a transport or protocol failure,
/// inner one is the rejection returned by the service
pub type ClientResult<T> = anyhow::Result<Result<T, Rejection>>;

#[derive(Clone)]
pub struct LibraryServiceClient {
    url: String,
    client: ClientWithMiddleware,
    caller: Option<Caller>,
}

impl LibraryServiceClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(100), Duration::from_secs(5))
            .build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                RetryStoreFailures,
            ))
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
            caller: None,
        })
    }

    /// Client sending the identity headers of the given caller
    pub fn signed_in_as(&self, caller: Caller) -> Self {
        Self {
            caller: Some(caller),
            ..self.clone()
        }
    }

    /// Client sending no identity headers
    pub fn anonymous(&self) -> Self {
        Self {
            caller: None,
            ..self.clone()
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.url, path));
        match self.caller {
            Some(caller) => builder
                .header(USER_ID_HEADER, caller.user_id.to_string())
                .header(USER_ROLE_HEADER, caller.role.as_str()),
            None => builder,
        }
    }

    /// Calls GET /health endpoint
    pub async fn health(&self) -> anyhow::Result<bool> {
        let response = self.request(Method::GET, "/health").send().await?;
        Ok(response.status().is_success())
    }

    /// Calls GET /api/books endpoint
    pub async fn list_books(&self, query: &BooksQuery) -> ClientResult<Vec<BookSummary>> {
        let response = self
            .request(Method::GET, "/api/books")
            .query(query)
            .send()
            .await?;
        Ok(json_or_rejection::<GetAllBooksResponse>(response)
            .await?
            .map(|response| response.books))
    }

    /// Calls GET /api/categories endpoint
    pub async fn list_categories(&self) -> ClientResult<Vec<String>> {
        let response = self.request(Method::GET, "/api/categories").send().await?;
        json_or_rejection(response).await
    }

    /// Calls POST /api/book endpoint
    /// Returns book_id of added book taken from the location header
    pub async fn add_book(&self, book_details: &BookDetails) -> ClientResult<BookId> {
        let response = self
            .request(Method::POST, "/api/book")
            .json(book_details)
            .send()
            .await?;
        id_from_location(response, "/api/book/").await
    }

    /// Calls GET /api/book/{book_id} endpoint
    pub async fn get_book(&self, book_id: BookId) -> ClientResult<Book> {
        let response = self
            .request(Method::GET, &format!("/api/book/{}", book_id))
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls PATCH /api/book/{book_id} endpoint
    pub async fn update_book(
        &self,
        book_id: BookId,
        patch: &BookDetailsPatch,
    ) -> ClientResult<()> {
        let response = self
            .request(Method::PATCH, &format!("/api/book/{}", book_id))
            .json(patch)
            .send()
            .await?;
        empty_or_rejection(response).await
    }

    /// Calls DELETE /api/book/{book_id} endpoint
    pub async fn delete_book(&self, book_id: BookId) -> ClientResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/api/book/{}", book_id))
            .send()
            .await?;
        empty_or_rejection(response).await
    }

    /// Calls POST /api/user endpoint
    /// Returns user_id of registered user taken from the location header
    pub async fn register_user(&self, new_user: &NewUser) -> ClientResult<UserId> {
        let response = self
            .request(Method::POST, "/api/user")
            .json(new_user)
            .send()
            .await?;
        id_from_location(response, "/api/user/").await
    }

    /// Calls GET /api/user/{user_id} endpoint
    pub async fn get_user(&self, user_id: UserId) -> ClientResult<UserDetails> {
        let response = self
            .request(Method::GET, &format!("/api/user/{}", user_id))
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls GET /api/users endpoint
    pub async fn list_users(&self) -> ClientResult<Vec<UserSummary>> {
        let response = self.request(Method::GET, "/api/users").send().await?;
        json_or_rejection(response).await
    }

    /// Calls PUT /api/user/{user_id}/role endpoint
    pub async fn set_user_role(&self, user_id: UserId, role: Role) -> ClientResult<()> {
        let response = self
            .request(Method::PUT, &format!("/api/user/{}/role", user_id))
            .json(&RoleUpdate { role })
            .send()
            .await?;
        empty_or_rejection(response).await
    }

    /// Calls POST /api/borrows endpoint
    pub async fn borrow_book(&self, book_id: BookId) -> ClientResult<Borrow> {
        let response = self
            .request(Method::POST, "/api/borrows")
            .json(&BorrowRequest { book_id })
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls POST /api/borrow/{borrow_id}/return endpoint
    pub async fn return_book(&self, borrow_id: BorrowId) -> ClientResult<Borrow> {
        let response = self
            .request(Method::POST, &format!("/api/borrow/{}/return", borrow_id))
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls GET /api/borrow/{borrow_id} endpoint
    pub async fn get_borrow(&self, borrow_id: BorrowId) -> ClientResult<Borrow> {
        let response = self
            .request(Method::GET, &format!("/api/borrow/{}", borrow_id))
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls GET /api/borrows endpoint
    pub async fn list_my_borrows(&self, active_only: bool) -> ClientResult<Vec<Borrow>> {
        let response = self
            .request(Method::GET, "/api/borrows")
            .query(&MyBorrowsQuery { active_only })
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls GET /api/admin/borrows endpoint
    pub async fn list_all_borrows(&self, query: &BorrowsQuery) -> ClientResult<Vec<Borrow>> {
        let response = self
            .request(Method::GET, "/api/admin/borrows")
            .query(query)
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls GET /api/favorites endpoint
    pub async fn list_favorites(&self) -> ClientResult<Vec<Favorite>> {
        let response = self.request(Method::GET, "/api/favorites").send().await?;
        json_or_rejection(response).await
    }

    /// Calls POST /api/favorite/{book_id} endpoint
    pub async fn add_favorite(&self, book_id: BookId) -> ClientResult<Favorite> {
        let response = self
            .request(Method::POST, &format!("/api/favorite/{}", book_id))
            .send()
            .await?;
        json_or_rejection(response).await
    }

    /// Calls DELETE /api/favorite/{book_id} endpoint
    pub async fn remove_favorite(&self, book_id: BookId) -> ClientResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/api/favorite/{}", book_id))
            .send()
            .await?;
        empty_or_rejection(response).await
    }

    /// Calls GET /api/admin/report endpoint
    pub async fn report(&self) -> ClientResult<LibraryReport> {
        let response = self.request(Method::GET, "/api/admin/report").send().await?;
        json_or_rejection(response).await
    }
}

async fn rejection(response: Response) -> anyhow::Result<Rejection> {
    let status = response.status();
    let Some(kind) = ErrorKind::from_status_code(status.as_u16()) else {
        let error = response.text().await.unwrap_or_default();
        bail!("Unexpected response {} {}", status, error)
    };
    let message: String = response.json().await.unwrap_or_default();
    Ok(Rejection { kind, message })
}

async fn json_or_rejection<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if response.status().is_success() {
        Ok(Ok(response.json().await?))
    } else {
        Ok(Err(rejection(response).await?))
    }
}

async fn empty_or_rejection(response: Response) -> ClientResult<()> {
    if response.status().is_success() {
        Ok(Ok(()))
    } else {
        Ok(Err(rejection(response).await?))
    }
}

async fn id_from_location(response: Response, prefix: &str) -> ClientResult<i32> {
    if !response.status().is_success() {
        return Ok(Err(rejection(response).await?));
    }

    let location_header = response
        .headers()
        .get(LOCATION)
        .context("No location header")?;

    let id = location_header
        .to_str()
        .context("Failed to convert header to str")?
        .strip_prefix(prefix)
        .context("Invalid location header")?
        .parse()
        .context("Failed to parse id")?;
    Ok(Ok(id))
}

#[cfg(test)]
mod client_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    fn reply(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        )
    }

    const BORROW_JSON: &str =
        r#"{"borrow_id":1,"user_id":7,"book_id":3,"borrowed_at":100,"returned_at":null}"#;

    /// Reads one whole request, headers and body
    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buffer = [0u8; 1024];
        loop {
            let read = socket.read(&mut buffer).await.unwrap_or(0);
            if read == 0 {
                return;
            }
            request.extend_from_slice(&buffer[..read]);
            let text = String::from_utf8_lossy(&request).to_lowercase();
            if let Some(headers_end) = text.find("\r\n\r\n") {
                let content_length = text[..headers_end]
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= headers_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    /// Serves one connection per scripted reply, None drops the connection without answering.
    /// Returns the url of the server and the number of requests it received.
    async fn scripted_server(script: Vec<Option<String>>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let received = requests.clone();
        tokio::spawn(async move {
            for scripted in script {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                received.fetch_add(1, Ordering::SeqCst);
                if let Some(response) = scripted {
                    socket.write_all(response.as_bytes()).await.unwrap();
                    socket.shutdown().await.ok();
                }
            }
        });
        (url, requests)
    }

    fn client(url: &str) -> LibraryServiceClient {
        LibraryServiceClient::new(url)
            .unwrap()
            .signed_in_as(Caller::new(7, Role::User))
    }

    #[tokio::test]
    /// Connection drops after the borrow reached the service,
    /// the borrow must not be sent again since it may be committed already
    async fn test_borrow_is_not_resent_after_dropped_connection() {
        let (url, requests) = scripted_server(vec![
            None,
            Some(reply("409 Conflict", r#""Book 3 is already borrowed""#)),
        ])
        .await;

        let result = client(&url).borrow_book(3).await;

        assert!(result.is_err());
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_return_is_not_resent_after_dropped_connection() {
        let (url, requests) = scripted_server(vec![
            None,
            Some(reply("409 Conflict", r#""Borrow 1 was already returned""#)),
        ])
        .await;

        let result = client(&url).return_book(1).await;

        assert!(result.is_err());
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_retried() {
        let (url, requests) = scripted_server(vec![
            Some(reply(
                "503 Service Unavailable",
                r#""Library storage is unavailable""#,
            )),
            Some(reply("200 OK", BORROW_JSON)),
        ])
        .await;

        let borrow = client(&url).borrow_book(3).await.unwrap().unwrap();

        assert_eq!(borrow.borrow_id, 1);
        assert_eq!(borrow.book_id, 3);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let (url, requests) = scripted_server(vec![
            Some(reply("500 Internal Server Error", r#""boom""#)),
            Some(reply("200 OK", BORROW_JSON)),
        ])
        .await;
        let result = client(&url).borrow_book(3).await;
        assert!(result.is_err());
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let (url, requests) = scripted_server(vec![
            Some(reply("409 Conflict", r#""Book 3 is already borrowed""#)),
            Some(reply("200 OK", BORROW_JSON)),
        ])
        .await;
        let rejection = client(&url).borrow_book(3).await.unwrap().unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::Conflict);
        assert_eq!(rejection.message, "Book 3 is already borrowed");
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }
}
