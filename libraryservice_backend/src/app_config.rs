use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(web::resource("/books").route(web::get().to(handlers::get_all_books)))
                .service(
                    web::resource("/categories")
                        .route(web::get().to(handlers::get_all_categories)),
                )
                .service(web::resource("/book").route(web::post().to(handlers::add_book)))
                .service(
                    web::resource("/book/{book_id}")
                        .route(web::get().to(handlers::get_book))
                        .route(web::patch().to(handlers::update_book))
                        .route(web::delete().to(handlers::delete_book)),
                )
                .service(web::resource("/users").route(web::get().to(handlers::get_all_users)))
                .service(web::resource("/user").route(web::post().to(handlers::add_user)))
                .service(
                    web::resource("/user/{user_id}").route(web::get().to(handlers::get_user)),
                )
                .service(
                    web::resource("/user/{user_id}/role")
                        .route(web::put().to(handlers::set_user_role)),
                )
                .service(
                    web::resource("/borrows")
                        .route(web::get().to(handlers::get_my_borrows))
                        .route(web::post().to(handlers::borrow_book)),
                )
                .service(
                    web::resource("/borrow/{borrow_id}")
                        .route(web::get().to(handlers::get_borrow)),
                )
                .service(
                    web::resource("/borrow/{borrow_id}/return")
                        .route(web::post().to(handlers::return_book)),
                )
                .service(
                    web::resource("/favorites").route(web::get().to(handlers::get_favorites)),
                )
                .service(
                    web::resource("/favorite/{book_id}")
                        .route(web::post().to(handlers::add_favorite))
                        .route(web::delete().to(handlers::remove_favorite)),
                )
                .service(
                    web::scope("/admin")
                        .service(
                            web::resource("/borrows")
                                .route(web::get().to(handlers::get_all_borrows)),
                        )
                        .service(
                            web::resource("/report").route(web::get().to(handlers::get_report)),
                        ),
                ),
        );
}
