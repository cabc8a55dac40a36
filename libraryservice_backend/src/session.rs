use std::future::{ready, Ready};

use actix_web::dev::Payload;
use actix_web::http::header::HeaderMap;
use actix_web::{FromRequest, HttpRequest};
use paperclip::actix::OperationModifier;
use paperclip::v2::schema::Apiv2Schema;

use crate::api::{Caller, USER_ID_HEADER, USER_ROLE_HEADER};

/// Identity of the caller as provided by the identity provider in front of the service.
/// Missing or malformed identity headers give an anonymous session.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Session(Option<Caller>);

impl Session {
    pub fn caller(&self) -> Option<Caller> {
        self.0
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        let user_id =
            header_value(headers, USER_ID_HEADER).and_then(|value| value.trim().parse().ok());
        let role =
            header_value(headers, USER_ROLE_HEADER).and_then(|value| value.parse().ok());

        match (user_id, role) {
            (Some(user_id), Some(role)) => Session(Some(Caller::new(user_id, role))),
            _ => Session(None),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

impl FromRequest for Session {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(Session::from_headers(req.headers())))
    }
}

impl Apiv2Schema for Session {}
impl OperationModifier for Session {}
