use std::time::UNIX_EPOCH;

use libraryservice_backend::api::{
    BookDetails, BookDetailsPatch, BooksQuery, BorrowsQuery, Caller, ErrorKind, NewUser, Role,
};
use libraryservice_backend::client::LibraryServiceClient;

const LIBRARYSERVICE_URL: &str = "http://127.0.0.1:8080";

/// Identity headers are trusted as given, the admin does not need to be registered
fn admin_client() -> LibraryServiceClient {
    LibraryServiceClient::new(LIBRARYSERVICE_URL)
        .expect("Failed to create client")
        .signed_in_as(Caller::new(0, Role::Admin))
}

fn unique_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

async fn register_user(client: &LibraryServiceClient, name: &str) -> Caller {
    let user_id = client
        .anonymous()
        .register_user(&NewUser {
            name: name.to_string(),
            email: format!("{}{}@library.test", name, unique_suffix()),
            profile_image: None,
        })
        .await
        .expect("Failed to register user")
        .expect("Registration rejected");
    Caller::new(user_id, Role::User)
}

#[tokio::test]
/// Simple test for the catalog
/// Adds a book as admin
/// Gets the book
/// Patches the book
/// Lists books filtered by category and checks if the book is there
async fn catalog_e2e_test() {
    let admin = admin_client();
    let category = format!("category{}", unique_suffix());

    let book_details = BookDetails {
        title: "The Left Hand of Darkness".to_string(),
        author: "Ursula K. Le Guin".to_string(),
        publication_year: Some(1969),
        cover_image: None,
        categories: vec![category.clone()],
    };

    let book_id = admin
        .add_book(&book_details)
        .await
        .expect("Failed to add book")
        .expect("Adding book rejected");

    let book = admin
        .get_book(book_id)
        .await
        .expect("Failed to get book")
        .expect("Book not found");
    assert_eq!(book.details, book_details);
    assert!(book.available);

    let updated_title = format!("updated title {}", unique_suffix());
    admin
        .update_book(
            book_id,
            &BookDetailsPatch {
                title: Some(updated_title.clone()),
                ..BookDetailsPatch::default()
            },
        )
        .await
        .expect("Failed to patch book")
        .expect("Patch rejected");

    let books = admin
        .list_books(&BooksQuery {
            category: Some(category.clone()),
            ..BooksQuery::default()
        })
        .await
        .expect("Failed to list books")
        .expect("Listing rejected");
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].book_id, book_id);
    assert_eq!(books[0].title, updated_title);

    let categories = admin
        .list_categories()
        .await
        .expect("Failed to list categories")
        .expect("Listing rejected");
    assert!(categories.contains(&category));

    // Regular users can not manage the catalog
    let reader = register_user(&admin, "Reader").await;
    let rejection = admin
        .signed_in_as(reader)
        .delete_book(book_id)
        .await
        .expect("Failed to call delete")
        .unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Forbidden);
}

#[tokio::test]
/// Borrow lifecycle over the wire
/// Registers two users
/// First user borrows a book, second one is rejected
/// Second user can not return the first user's borrow
/// First user returns the book, second user borrows it
/// Admin sees the active borrow of the second user
async fn borrow_lifecycle_e2e_test() {
    let admin = admin_client();

    let book_id = admin
        .add_book(&BookDetails {
            title: "Kindred".to_string(),
            author: "Octavia E. Butler".to_string(),
            publication_year: Some(1979),
            cover_image: None,
            categories: vec!["fiction".to_string()],
        })
        .await
        .expect("Failed to add book")
        .expect("Adding book rejected");

    let alice = admin.signed_in_as(register_user(&admin, "Alice").await);
    let bob = admin.signed_in_as(register_user(&admin, "Bob").await);

    // BORROW
    let borrow = alice
        .borrow_book(book_id)
        .await
        .expect("Failed to borrow")
        .expect("Borrow rejected");
    assert_eq!(borrow.book_id, book_id);
    assert!(borrow.returned_at.is_none());

    let book = admin.get_book(book_id).await.unwrap().unwrap();
    assert!(!book.available);

    // BORROW AGAIN - book is already out
    let rejection = bob
        .borrow_book(book_id)
        .await
        .expect("Failed to borrow")
        .unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Conflict);

    // RETURN by someone else
    let rejection = bob
        .return_book(borrow.borrow_id)
        .await
        .expect("Failed to return")
        .unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Forbidden);

    // RETURN without session
    let rejection = alice
        .anonymous()
        .return_book(borrow.borrow_id)
        .await
        .expect("Failed to return")
        .unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Unauthorized);

    // RETURN
    let returned = alice
        .return_book(borrow.borrow_id)
        .await
        .expect("Failed to return")
        .expect("Return rejected");
    assert!(returned.returned_at.is_some());

    let rejection = alice
        .return_book(borrow.borrow_id)
        .await
        .expect("Failed to return")
        .unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Conflict);

    let active = alice
        .list_my_borrows(true)
        .await
        .expect("Failed to list borrows")
        .expect("Listing rejected");
    assert!(active.iter().all(|borrow| borrow.book_id != book_id));

    // BORROW by the second user
    let second_borrow = bob
        .borrow_book(book_id)
        .await
        .expect("Failed to borrow")
        .expect("Borrow rejected");

    let bob_id = second_borrow.user_id;
    let history = admin
        .list_all_borrows(&BorrowsQuery {
            user_id: Some(bob_id),
            active_only: true,
        })
        .await
        .expect("Failed to list borrows")
        .expect("Listing rejected");
    assert_eq!(history, vec![second_borrow]);

    let report = admin
        .report()
        .await
        .expect("Failed to get report")
        .expect("Report rejected");
    assert!(report.active_borrows >= 1);
    assert_eq!(
        report.available_books + report.borrowed_books,
        report.total_books
    );
}

#[tokio::test]
/// Many users race for one copy, exactly one of them gets it
async fn concurrent_borrows_e2e_test() {
    const NO_OF_USERS: usize = 8;
    let admin = admin_client();

    let book_id = admin
        .add_book(&BookDetails {
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            publication_year: Some(1965),
            cover_image: None,
            categories: vec![],
        })
        .await
        .unwrap()
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..NO_OF_USERS {
        let client = admin.signed_in_as(register_user(&admin, &format!("Racer{}", i)).await);
        handles.push(tokio::spawn(
            async move { client.borrow_book(book_id).await },
        ));
    }

    let mut granted = 0;
    for handle in handles {
        match handle.await.unwrap().expect("Failed to borrow") {
            Ok(_) => granted += 1,
            Err(rejection) => assert_eq!(rejection.kind, ErrorKind::Conflict),
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
/// Favorites are per user and can be added once
async fn favorites_e2e_test() {
    let admin = admin_client();
    let book_id = admin
        .add_book(&BookDetails {
            title: "Piranesi".to_string(),
            author: "Susanna Clarke".to_string(),
            publication_year: Some(2020),
            cover_image: None,
            categories: vec![],
        })
        .await
        .unwrap()
        .unwrap();

    let reader = admin.signed_in_as(register_user(&admin, "Favoriter").await);

    let favorite = reader
        .add_favorite(book_id)
        .await
        .expect("Failed to add favorite")
        .expect("Favorite rejected");
    assert_eq!(favorite.book_id, book_id);

    let rejection = reader.add_favorite(book_id).await.unwrap().unwrap_err();
    assert_eq!(rejection.kind, ErrorKind::Conflict);

    let favorites = reader.list_favorites().await.unwrap().unwrap();
    assert_eq!(favorites, vec![favorite]);

    reader
        .remove_favorite(book_id)
        .await
        .expect("Failed to remove favorite")
        .expect("Removal rejected");
    assert!(reader.list_favorites().await.unwrap().unwrap().is_empty());
}
