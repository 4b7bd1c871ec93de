pub mod auth;
pub mod token;
pub mod user;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use utoipa_axum::router::OpenApiRouter;

use crate::service::IdentityService;

pub const REFRESH_TOKEN_COOKIE_NAME: &str = "hearth_refresh_token";

pub fn create_router() -> OpenApiRouter<IdentityService> {
    OpenApiRouter::new()
        .merge(auth::create_auth_routes())
        .merge(token::create_token_routes())
        .merge(user::create_user_admin_routes())
}

/// Attach the refresh token as an HttpOnly cookie scoped to the auth
/// endpoints; the JSON body stays authoritative for API clients.
pub(crate) fn add_refresh_cookie(jar: CookieJar, refresh_token: &str) -> CookieJar {
    let mut cookie = Cookie::new(REFRESH_TOKEN_COOKIE_NAME, refresh_token.to_string());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/auth");
    jar.add(cookie)
}

pub(crate) fn remove_refresh_cookie(jar: CookieJar) -> CookieJar {
    let mut cookie = Cookie::new(REFRESH_TOKEN_COOKIE_NAME, "");
    cookie.set_path("/auth");
    jar.remove(cookie)
}

pub(crate) fn refresh_token_from_jar(jar: &CookieJar) -> Option<String> {
    jar.get(REFRESH_TOKEN_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
}
