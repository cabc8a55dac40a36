use actix_web::http::header::LOCATION;
use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::{Error, HttpResponse};
use paperclip::actix::{
    api_v2_operation,
    web::{self},
};

use crate::api::{
    BookDetails, BookDetailsPatch, BookId, BooksQuery, BorrowId, BorrowRequest, BorrowsQuery,
    ErrorKind, GetAllBooksResponse, MyBorrowsQuery, NewUser, RoleUpdate, UserId,
};
use crate::errors::LibraryError;
use crate::library_service::LibraryService;
use crate::session::Session;

/// Maps a rejected operation to its status code, the body carries the message for the user
fn failure_response(operation: &str, err: LibraryError) -> HttpResponse {
    let kind = err.kind();
    if kind == ErrorKind::StoreFailure {
        tracing::error!("{} failed {:?}", operation, err);
    } else {
        tracing::info!("{} rejected: {}", operation, err);
    }
    let status =
        StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(err.to_string())
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn get_all_books(
    library: Data<LibraryService>,
    query: web::Query<BooksQuery>,
) -> Result<HttpResponse, Error> {
    Ok(match library.list_books(query.into_inner()).await {
        Ok(books) => HttpResponse::Ok().json(GetAllBooksResponse { books }),
        Err(err) => failure_response("Get all books", err),
    })
}

#[api_v2_operation]
pub async fn get_all_categories(library: Data<LibraryService>) -> Result<HttpResponse, Error> {
    Ok(match library.list_categories().await {
        Ok(categories) => HttpResponse::Ok().json(categories),
        Err(err) => failure_response("Get all categories", err),
    })
}

#[api_v2_operation]
pub async fn add_book(
    library: Data<LibraryService>,
    session: Session,
    details: web::Json<BookDetails>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library.add_book(session.caller(), details.into_inner()).await {
            Ok(book_id) => HttpResponse::Ok()
                .append_header((LOCATION, format!("/api/book/{}", book_id)))
                .finish(),
            Err(err) => failure_response("Add book", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_book(
    library: Data<LibraryService>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match library.get_book(book_id.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => failure_response("Get book", err),
    })
}

#[api_v2_operation]
pub async fn update_book(
    library: Data<LibraryService>,
    session: Session,
    book_id: web::Path<BookId>,
    patch: web::Json<BookDetailsPatch>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .update_book(session.caller(), book_id.into_inner(), patch.into_inner())
            .await
        {
            Ok(_) => HttpResponse::Ok().finish(),
            Err(err) => failure_response("Update book", err),
        },
    )
}

#[api_v2_operation]
pub async fn delete_book(
    library: Data<LibraryService>,
    session: Session,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .delete_book(session.caller(), book_id.into_inner())
            .await
        {
            Ok(_) => HttpResponse::Ok().finish(),
            Err(err) => failure_response("Delete book", err),
        },
    )
}

#[api_v2_operation]
pub async fn add_user(
    library: Data<LibraryService>,
    new_user: web::Json<NewUser>,
) -> Result<HttpResponse, Error> {
    Ok(match library.register_user(new_user.into_inner()).await {
        Ok(user_id) => HttpResponse::Ok()
            .append_header((LOCATION, format!("/api/user/{}", user_id)))
            .finish(),
        Err(err) => failure_response("Add user", err),
    })
}

#[api_v2_operation]
pub async fn get_all_users(
    library: Data<LibraryService>,
    session: Session,
) -> Result<HttpResponse, Error> {
    Ok(match library.list_users(session.caller()).await {
        Ok(users) => HttpResponse::Ok().json(users),
        Err(err) => failure_response("Get all users", err),
    })
}

#[api_v2_operation]
pub async fn get_user(
    library: Data<LibraryService>,
    session: Session,
    user_id: web::Path<UserId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .get_user(session.caller(), user_id.into_inner())
            .await
        {
            Ok(details) => HttpResponse::Ok().json(details),
            Err(err) => failure_response("Get user", err),
        },
    )
}

#[api_v2_operation]
pub async fn set_user_role(
    library: Data<LibraryService>,
    session: Session,
    user_id: web::Path<UserId>,
    update: web::Json<RoleUpdate>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .set_user_role(session.caller(), user_id.into_inner(), update.role)
            .await
        {
            Ok(_) => HttpResponse::Ok().finish(),
            Err(err) => failure_response("Set user role", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_my_borrows(
    library: Data<LibraryService>,
    session: Session,
    query: web::Query<MyBorrowsQuery>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .list_my_borrows(session.caller(), query.active_only)
            .await
        {
            Ok(borrows) => HttpResponse::Ok().json(borrows),
            Err(err) => failure_response("Get my borrows", err),
        },
    )
}

#[api_v2_operation]
pub async fn borrow_book(
    library: Data<LibraryService>,
    session: Session,
    request: web::Json<BorrowRequest>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .borrow_book(session.caller(), request.book_id)
            .await
        {
            Ok(borrow) => HttpResponse::Ok()
                .append_header((LOCATION, format!("/api/borrow/{}", borrow.borrow_id)))
                .json(borrow),
            Err(err) => failure_response("Borrow book", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_borrow(
    library: Data<LibraryService>,
    session: Session,
    borrow_id: web::Path<BorrowId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .get_borrow(session.caller(), borrow_id.into_inner())
            .await
        {
            Ok(borrow) => HttpResponse::Ok().json(borrow),
            Err(err) => failure_response("Get borrow", err),
        },
    )
}

#[api_v2_operation]
pub async fn return_book(
    library: Data<LibraryService>,
    session: Session,
    borrow_id: web::Path<BorrowId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .return_book(session.caller(), borrow_id.into_inner())
            .await
        {
            Ok(borrow) => HttpResponse::Ok().json(borrow),
            Err(err) => failure_response("Return book", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_favorites(
    library: Data<LibraryService>,
    session: Session,
) -> Result<HttpResponse, Error> {
    Ok(match library.list_favorites(session.caller()).await {
        Ok(favorites) => HttpResponse::Ok().json(favorites),
        Err(err) => failure_response("Get favorites", err),
    })
}

#[api_v2_operation]
pub async fn add_favorite(
    library: Data<LibraryService>,
    session: Session,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .add_favorite(session.caller(), book_id.into_inner())
            .await
        {
            Ok(favorite) => HttpResponse::Ok().json(favorite),
            Err(err) => failure_response("Add favorite", err),
        },
    )
}

#[api_v2_operation]
pub async fn remove_favorite(
    library: Data<LibraryService>,
    session: Session,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .remove_favorite(session.caller(), book_id.into_inner())
            .await
        {
            Ok(_) => HttpResponse::Ok().finish(),
            Err(err) => failure_response("Remove favorite", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_all_borrows(
    library: Data<LibraryService>,
    session: Session,
    query: web::Query<BorrowsQuery>,
) -> Result<HttpResponse, Error> {
    Ok(
        match library
            .list_all_borrows(session.caller(), query.into_inner())
            .await
        {
            Ok(borrows) => HttpResponse::Ok().json(borrows),
            Err(err) => failure_response("Get all borrows", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_report(
    library: Data<LibraryService>,
    session: Session,
) -> Result<HttpResponse, Error> {
    Ok(match library.library_report(session.caller()).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => failure_response("Get report", err),
    })
}

#[cfg(test)]
mod handler_tests {
    use std::sync::Arc;

    use actix_web::test::{self, TestRequest};
    use actix_web::App;
    use paperclip::actix::OpenApiExt;

    use crate::api::{Book, Borrow, Caller, LibraryReport, Role, USER_ID_HEADER, USER_ROLE_HEADER};
    use crate::app_config::config_app;
    use crate::library_repository::InMemoryLibraryRepository;

    use super::*;

    fn library() -> LibraryService {
        LibraryService::new(Arc::new(InMemoryLibraryRepository::default()), 5)
    }

    macro_rules! app {
        ($library:expr) => {
            test::init_service(
                App::new()
                    .wrap_api()
                    .app_data(Data::new($library))
                    .configure(config_app)
                    .build(),
            )
            .await
        };
    }

    fn signed_in(req: TestRequest, user_id: UserId, role: &str) -> TestRequest {
        req.insert_header((USER_ID_HEADER, user_id.to_string()))
            .insert_header((USER_ROLE_HEADER, role.to_string()))
    }

    async fn seed(library: &LibraryService) -> (BookId, UserId, UserId) {
        let admin = Some(Caller::new(1000, Role::Admin));
        let book_id = library
            .add_book(
                admin,
                BookDetails {
                    title: "B1".to_string(),
                    author: "Author".to_string(),
                    publication_year: None,
                    cover_image: None,
                    categories: vec![],
                },
            )
            .await
            .unwrap();
        let u1 = library
            .register_user(NewUser {
                name: "u1".to_string(),
                email: "u1@library.test".to_string(),
                profile_image: None,
            })
            .await
            .unwrap();
        let u2 = library
            .register_user(NewUser {
                name: "u2".to_string(),
                email: "u2@library.test".to_string(),
                profile_image: None,
            })
            .await
            .unwrap();
        (book_id, u1, u2)
    }

    #[actix_web::test]
    async fn test_health() {
        let app = app!(library());
        let resp = test::call_service(&app, TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    /// Borrow/return scenario through HTTP
    /// 1. U1 borrows B1
    /// 2. U2 borrow of B1 - 409
    /// 3. U2 return of U1 borrow - 403
    /// 4. U1 returns - 200, book available
    /// 5. U1 returns again - 409
    async fn test_borrow_return_over_http() {
        let library = library();
        let (book_id, u1, u2) = seed(&library).await;
        let app = app!(library);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri("/api/borrows"), u1, "user")
                .set_json(BorrowRequest { book_id })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let borrow: Borrow = test::read_body_json(resp).await;
        assert_eq!(borrow.user_id, u1);
        assert_eq!(borrow.returned_at, None);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri("/api/borrows"), u2, "user")
                .set_json(BorrowRequest { book_id })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let message: String = test::read_body_json(resp).await;
        assert!(message.contains("already borrowed"));

        let return_uri = format!("/api/borrow/{}/return", borrow.borrow_id);
        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri(&return_uri), u2, "user").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri(&return_uri), u1, "user").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let book: Book = test::call_and_read_body_json(
            &app,
            TestRequest::get()
                .uri(&format!("/api/book/{}", book_id))
                .to_request(),
        )
        .await;
        assert!(book.available);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri(&return_uri), u1, "user").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let message: String = test::read_body_json(resp).await;
        assert!(message.contains("already returned"));
    }

    #[actix_web::test]
    async fn test_missing_session_is_unauthorized() {
        let library = library();
        let (book_id, _, _) = seed(&library).await;
        let app = app!(library);

        let resp = test::call_service(
            &app,
            TestRequest::post()
                .uri("/api/borrows")
                .set_json(BorrowRequest { book_id })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = test::call_service(
            &app,
            TestRequest::get().uri("/api/favorites").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_untyped_borrow_body_is_rejected() {
        let library = library();
        let (_, u1, _) = seed(&library).await;
        let app = app!(library);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri("/api/borrows"), u1, "user")
                .set_json(serde_json::json!({"book_id": "one", "user_id": 5}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_admin_role_is_case_insensitive() {
        let library = library();
        seed(&library).await;
        let app = app!(library);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::get().uri("/api/admin/report"), 1000, "ADMIN").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let report: LibraryReport = test::read_body_json(resp).await;
        assert_eq!(report.total_books, 1);
        assert_eq!(report.total_users, 2);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::get().uri("/api/admin/report"), 1, "user").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_book_management_over_http() {
        let app = app!(library());

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::post().uri("/api/book"), 1, "admin")
                .set_json(BookDetails {
                    title: "Dune".to_string(),
                    author: "Frank Herbert".to_string(),
                    publication_year: Some(1965),
                    cover_image: None,
                    categories: vec!["scifi".to_string()],
                })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let location = resp
            .headers()
            .get(LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let book_id: BookId = location
            .strip_prefix("/api/book/")
            .unwrap()
            .parse()
            .unwrap();

        // availability is not patchable
        let resp = test::call_service(
            &app,
            signed_in(TestRequest::patch().uri(&location), 1, "admin")
                .set_json(serde_json::json!({"available": false}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::patch().uri(&location), 1, "admin")
                .set_json(BookDetailsPatch {
                    title: Some("Dune Messiah".to_string()),
                    ..BookDetailsPatch::default()
                })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let response: GetAllBooksResponse = test::call_and_read_body_json(
            &app,
            TestRequest::get()
                .uri("/api/books?category=scifi&available_only=true")
                .to_request(),
        )
        .await;
        assert_eq!(response.books.len(), 1);
        assert_eq!(response.books[0].book_id, book_id);
        assert_eq!(response.books[0].title, "Dune Messiah");

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::delete().uri(&location), 2, "user").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = test::call_service(
            &app,
            signed_in(TestRequest::delete().uri(&location), 1, "admin").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = test::call_service(&app, TestRequest::get().uri(&location).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
