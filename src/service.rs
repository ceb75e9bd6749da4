use async_mutex::Mutex;
use cached::stores::TimedCache;
use cached::Cached;
use std::sync::Arc;
use tide::Request;

use crate::crypto::{self, SessionSigner};
use crate::pages::Pages;
use crate::playlist::PlaylistSession;
use crate::session::SessionStore;
use crate::spotify::{AuthProvider, NewPlaylist, SpotifyApi};
use crate::token::{AuthenticatedClient, TokenManager};
use crate::utils::Clock;
use crate::{AppError, Config, Result, LOG};

const SESSION_COOKIE: &str = "session";
const SEARCH_LIMIT: u32 = 10;

#[derive(Clone)]
pub struct Context {
    config: Arc<Config>,
    tokens: TokenManager,
    playlists: PlaylistSession,
    signer: SessionSigner,
    pages: Pages,
    // one-time `state` tokens handed to spotify on login
    login_states: Arc<Mutex<TimedCache<String, ()>>>,
}

impl Context {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<dyn SessionStore>,
        provider: Arc<dyn AuthProvider>,
        api: Arc<dyn SpotifyApi>,
        clock: Arc<dyn Clock>,
        pages: Pages,
    ) -> Self {
        Self {
            tokens: TokenManager::new(provider, api, sessions.clone(), clock),
            playlists: PlaylistSession::new(sessions),
            signer: SessionSigner::new(&config.secret_key),
            pages,
            login_states: Arc::new(Mutex::new(TimedCache::with_lifespan(
                config.login_state_ttl_seconds,
            ))),
            config,
        }
    }
}

pub fn app(ctx: Context) -> tide::Server<Context> {
    let mut app = tide::with_state(ctx);
    app.at("/").get(index);
    app.at("/status").get(status);
    app.at("/login").get(login);
    app.at("/callback").get(auth_callback);
    app.at("/dashboard").get(dashboard);
    app.at("/search").get(search);
    app.at("/create_playlist").post(create_playlist);
    app.at("/add_to_playlist").post(add_to_playlist);
    app.at("/finish").get(finish);
    app.with(crate::logging::LogMiddleware::new());
    app
}

pub async fn start(ctx: Context) -> anyhow::Result<()> {
    let host = ctx.config.host();
    let app = app(ctx);
    slog::info!(LOG, "running at {}", host);
    app.listen(host).await?;
    Ok(())
}

/// The verified session id from the request's session cookie
fn session_id(req: &Request<Context>) -> Option<String> {
    let cookie = req.cookie(SESSION_COOKIE)?;
    let session_id = req.state().signer.verify(cookie.value());
    if session_id.is_none() {
        slog::info!(LOG, "ignoring session cookie with a bad signature");
    }
    session_id
}

fn session_cookie(ctx: &Context, session_id: &str) -> String {
    format!(
        "{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}{secure}",
        name = SESSION_COOKIE,
        value = ctx.signer.sign(session_id),
        max_age = ctx.config.session_ttl_seconds,
        secure = if ctx.config.ssl { "; Secure" } else { "" },
    )
}

/// The current session and a spotify client with a valid access token
async fn authenticated(req: &Request<Context>) -> Result<(String, AuthenticatedClient)> {
    let session_id = session_id(req).ok_or(AppError::NotAuthenticated)?;
    let client = req
        .state()
        .tokens
        .resolve_active_credential(&session_id)
        .await?
        .ok_or(AppError::NotAuthenticated)?;
    Ok((session_id, client))
}

fn json_ok(value: serde_json::Value) -> tide::Response {
    tide::Response::builder(200).body(value).build()
}

async fn index(req: Request<Context>) -> tide::Result {
    let ctx = req.state();
    if let Some(session_id) = session_id(&req) {
        match ctx.tokens.is_authenticated(&session_id).await {
            Ok(true) => return Ok(tide::Redirect::new("/dashboard").into()),
            Ok(false) => (),
            Err(e) => return Ok(e.into_response()),
        }
    }
    match ctx.pages.index() {
        Ok(page) => Ok(resp!(html => page)),
        Err(e) => Ok(e.into_response()),
    }
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(req: Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &req.state().config.version,
    }))
}

async fn new_login_state(ctx: &Context) -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let mut lock = ctx.login_states.lock().await;
    // drop states that never made it back to the callback
    lock.flush();
    lock.cache_set(s.clone(), ());
    s
}

async fn is_valid_login_state(ctx: &Context, state: &str) -> bool {
    let mut lock = ctx.login_states.lock().await;
    lock.cache_remove(&state.to_string()).is_some()
}

/// The login process uses spotify to authenticate the current user
/// which then redirects back to our callback url with a code we
/// can use to generate reusable access and refresh API tokens.
async fn login(req: Request<Context>) -> tide::Result {
    let ctx = req.state();
    let state = new_login_state(ctx).await;
    match ctx.tokens.begin_authorization(&state) {
        Ok(url) => {
            slog::info!(LOG, "redirecting to spotify-auth"; "state" => &state);
            Ok(tide::Redirect::new(url).into())
        }
        Err(e) => Ok(e.into_response()),
    }
}

#[derive(Debug, serde::Deserialize)]
struct SpotifyAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// after we redirect users to spotify to login, spotify will send
/// them back to this endpoint with a single-use `code` and the
/// `state` we sent along. `state` must be one we handed out and
/// can only be used once.
async fn auth_callback(req: Request<Context>) -> tide::Result {
    Ok(complete_login(&req)
        .await
        .unwrap_or_else(AppError::into_text_response))
}

async fn complete_login(req: &Request<Context>) -> Result<tide::Response> {
    let ctx = req.state();
    let params: SpotifyAuthCallback = req
        .query()
        .map_err(|e| AppError::Auth(format!("invalid callback query {}", e)))?;
    if let Some(error) = params.error {
        return Err(AppError::Auth(error));
    }
    let state = params.state.unwrap_or_default();
    if !is_valid_login_state(ctx, &state).await {
        return Err(AppError::Auth(format!("invalid login state {}", state)));
    }
    // a login always starts a new session, whatever cookie came along
    let previous_session = session_id(req);
    let session_id = crypto::new_session_id()?;
    ctx.tokens
        .complete_authorization(
            &session_id,
            previous_session.as_deref(),
            params.code.as_deref().unwrap_or_default(),
        )
        .await?;
    slog::info!(LOG, "completing user login");
    let mut resp: tide::Response = tide::Redirect::new("/dashboard").into();
    resp.insert_header("set-cookie", session_cookie(ctx, &session_id));
    Ok(resp)
}

async fn dashboard(req: Request<Context>) -> tide::Result {
    let client = match authenticated(&req).await {
        Ok((_, client)) => client,
        Err(AppError::NotAuthenticated) => return Ok(tide::Redirect::new("/login").into()),
        Err(e) => return Ok(e.into_response()),
    };
    let user = match client.current_user().await {
        Ok(user) => user,
        Err(e) => return Ok(e.unexpected().into_response()),
    };
    match req.state().pages.dashboard(user.name()) {
        Ok(page) => Ok(resp!(html => page)),
        Err(e) => Ok(e.into_response()),
    }
}

#[derive(serde::Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search(req: Request<Context>) -> tide::Result {
    Ok(search_tracks(&req)
        .await
        .unwrap_or_else(AppError::into_response))
}

async fn search_tracks(req: &Request<Context>) -> Result<tide::Response> {
    let (_, client) = authenticated(req).await?;
    let params: SearchParams = req
        .query()
        .map_err(|e| AppError::Validation(format!("invalid query parameters {}", e)))?;
    let query = params.q.unwrap_or_default();
    let query = query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("Search query is required".to_string()));
    }
    let results = client
        .search_tracks(query, SEARCH_LIMIT)
        .await
        .map_err(AppError::unexpected)?;
    Ok(json_ok(results))
}

#[derive(serde::Deserialize)]
struct CreatePlaylistForm {
    playlist_name: Option<String>,
    playlist_description: Option<String>,
}

async fn create_playlist(mut req: Request<Context>) -> tide::Result {
    Ok(new_playlist(&mut req)
        .await
        .unwrap_or_else(AppError::into_response))
}

async fn new_playlist(req: &mut Request<Context>) -> Result<tide::Response> {
    let ctx = req.state().clone();
    let (session_id, client) = authenticated(req).await?;
    let form: CreatePlaylistForm = req
        .body_form()
        .await
        .map_err(|e| AppError::Validation(format!("invalid form body {}", e)))?;
    let name = form.playlist_name.unwrap_or_default();
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Playlist name is required".to_string()));
    }
    let user = client.current_user().await?;
    let playlist = client
        .create_playlist(
            &user.id,
            &NewPlaylist {
                name: name.to_string(),
                public: true,
                description: form
                    .playlist_description
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            },
        )
        .await?;
    ctx.playlists
        .set_current_playlist(&session_id, &playlist.id)
        .await?;
    slog::info!(LOG, "created playlist"; "playlist_id" => &playlist.id, "user_id" => &user.id);
    Ok(json_ok(serde_json::json!({
        "success": true,
        "playlist": {
            "id": playlist.id,
            "name": playlist.name,
            "url": playlist.external_urls.spotify,
        }
    })))
}

#[derive(serde::Deserialize)]
struct AddTrack {
    track_uri: Option<String>,
}

async fn add_to_playlist(mut req: Request<Context>) -> tide::Result {
    Ok(add_track(&mut req)
        .await
        .unwrap_or_else(AppError::into_response))
}

async fn add_track(req: &mut Request<Context>) -> Result<tide::Response> {
    let ctx = req.state().clone();
    let (session_id, client) = authenticated(req).await?;
    let is_json = req
        .content_type()
        .map(|mime| mime.essence() == "application/json")
        .unwrap_or(false);
    let body: tide::Result<AddTrack> = if is_json {
        req.body_json().await
    } else {
        req.body_form().await
    };
    let body = body.map_err(|e| AppError::Validation(format!("invalid request body {}", e)))?;
    let track_uri = body
        .track_uri
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| AppError::Validation("Missing track_uri".to_string()))?;
    let playlist_id = ctx
        .playlists
        .get_current_playlist(&session_id)
        .await?
        .ok_or_else(|| AppError::Validation("No active playlist".to_string()))?;
    client
        .add_items(&playlist_id, &[track_uri])
        .await
        .map_err(AppError::unexpected)?;
    Ok(json_ok(serde_json::json!({ "success": true })))
}

async fn finish(req: Request<Context>) -> tide::Result {
    if let Some(session_id) = session_id(&req) {
        if let Err(e) = req
            .state()
            .playlists
            .clear_current_playlist(&session_id)
            .await
        {
            return Ok(e.into_response());
        }
    }
    Ok(json_ok(serde_json::json!({
        "success": true,
        "message": "Playlist session cleared",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use crate::spotify::testing::{FakeAuth, FakeSpotify};
    use crate::utils::testing::ManualClock;
    use tide::http::{mime, Method, Url};
    use tide::StatusCode;

    const SESSION: &str = "test-session";

    struct TestApp {
        app: tide::Server<Context>,
        ctx: Context,
        auth: Arc<FakeAuth>,
        spotify: Arc<FakeSpotify>,
        clock: Arc<ManualClock>,
    }

    fn test_app() -> TestApp {
        test_app_with(crate::test_config())
    }

    fn test_app_with(config: Config) -> TestApp {
        let auth = Arc::new(FakeAuth::new());
        let spotify = Arc::new(FakeSpotify::default());
        let clock = Arc::new(ManualClock::at(1_600_000_000));
        let ctx = Context::new(
            Arc::new(config),
            Arc::new(MemorySessionStore::new(3600)),
            auth.clone(),
            spotify.clone(),
            clock.clone(),
            Pages::new().unwrap(),
        );
        TestApp {
            app: app(ctx.clone()),
            ctx,
            auth,
            spotify,
            clock,
        }
    }

    impl TestApp {
        /// Log `SESSION` in and return its cookie header
        async fn logged_in(&self) -> String {
            self.ctx
                .tokens
                .complete_authorization(SESSION, None, "code")
                .await
                .unwrap();
            format!("{}={}", SESSION_COOKIE, self.ctx.signer.sign(SESSION))
        }

        async fn send(
            &self,
            method: Method,
            path: &str,
            cookie: Option<&str>,
            body: Option<(mime::Mime, &str)>,
        ) -> tide::http::Response {
            let url = Url::parse(&format!("http://localhost{}", path)).unwrap();
            let mut req = tide::http::Request::new(method, url);
            if let Some(cookie) = cookie {
                req.insert_header("cookie", cookie);
            }
            if let Some((content_type, body)) = body {
                req.set_body(body.to_string());
                req.set_content_type(content_type);
            }
            self.app.respond(req).await.unwrap()
        }

        async fn get(&self, path: &str, cookie: Option<&str>) -> tide::http::Response {
            self.send(Method::Get, path, cookie, None).await
        }

        async fn post_form(&self, path: &str, cookie: &str, body: &str) -> tide::http::Response {
            self.send(Method::Post, path, Some(cookie), Some((mime::FORM, body)))
                .await
        }

        async fn post_json(&self, path: &str, cookie: &str, body: &str) -> tide::http::Response {
            self.send(Method::Post, path, Some(cookie), Some((mime::JSON, body)))
                .await
        }
    }

    async fn json(resp: &mut tide::http::Response) -> serde_json::Value {
        resp.body_json().await.unwrap()
    }

    fn header(resp: &tide::http::Response, name: &str) -> String {
        resp.header(name).unwrap().last().as_str().to_string()
    }

    #[async_std::test]
    async fn search_requires_a_session() {
        let t = test_app();
        let mut resp = t.get("/search?q=test", None).await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
        assert_eq!(json(&mut resp).await["error"], "Not logged in");

        // a forged cookie is as good as none
        let forged = format!("{}={}.{}", SESSION_COOKIE, SESSION, "00ff");
        t.logged_in().await;
        let resp = t.get("/search?q=test", Some(&forged)).await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
    }

    #[async_std::test]
    async fn search_forwards_to_spotify() {
        let t = test_app();
        let cookie = t.logged_in().await;
        let mut resp = t.get("/search?q=road%20trip", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let body = json(&mut resp).await;
        assert_eq!(body["tracks"]["items"][0]["uri"], "spotify:track:abc");
        assert_eq!(
            *t.spotify.searches.lock().unwrap(),
            vec![("road trip".to_string(), 10)]
        );
        assert_eq!(*t.spotify.tokens_seen.lock().unwrap(), vec!["access-1"]);

        let resp = t.get("/search?q=%20", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
    }

    #[async_std::test]
    async fn search_failures_are_server_errors() {
        let t = test_app();
        let cookie = t.logged_in().await;
        *t.spotify.search_error.lock().unwrap() =
            Some(AppError::Provider("http status: 429, rate limited".to_string()));
        let mut resp = t.get("/search?q=test", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);
        assert_eq!(json(&mut resp).await["error"], "http status: 429, rate limited");
    }

    #[async_std::test]
    async fn create_playlist_requires_a_name() {
        let t = test_app();
        let cookie = t.logged_in().await;
        for body in &["playlist_name=", "playlist_name=%20%20", ""] {
            let mut resp = t.post_form("/create_playlist", &cookie, body).await;
            assert_eq!(resp.status(), StatusCode::BadRequest);
            assert_eq!(json(&mut resp).await["error"], "Playlist name is required");
        }
        assert!(t.spotify.created.lock().unwrap().is_empty());
        assert_eq!(
            t.ctx.playlists.get_current_playlist(SESSION).await.unwrap(),
            None
        );
    }

    #[async_std::test]
    async fn create_playlist_sets_the_current_playlist() {
        let t = test_app();
        let cookie = t.logged_in().await;
        let mut resp = t
            .post_form(
                "/create_playlist",
                &cookie,
                "playlist_name=Road+Trip&playlist_description=+long+drive+",
            )
            .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(
            json(&mut resp).await,
            serde_json::json!({
                "success": true,
                "playlist": {
                    "id": "pl-1",
                    "name": "Road Trip",
                    "url": "https://open.spotify.com/playlist/pl-1",
                }
            })
        );
        assert_eq!(
            t.ctx.playlists.get_current_playlist(SESSION).await.unwrap(),
            Some("pl-1".to_string())
        );
        let created = t.spotify.created.lock().unwrap();
        let (user_id, playlist) = &created[0];
        assert_eq!(user_id, "user-1");
        assert!(playlist.public);
        assert_eq!(playlist.description, "long drive");
    }

    #[async_std::test]
    async fn create_playlist_without_a_session() {
        let t = test_app();
        let resp = t
            .send(
                Method::Post,
                "/create_playlist",
                None,
                Some((mime::FORM, "playlist_name=Road+Trip")),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
    }

    #[async_std::test]
    async fn create_playlist_surfaces_spotify_errors() {
        let t = test_app();
        let cookie = t.logged_in().await;
        *t.spotify.create_error.lock().unwrap() = Some(AppError::Provider(
            "http status: 403, Insufficient client scope".to_string(),
        ));
        let mut resp = t
            .post_form("/create_playlist", &cookie, "playlist_name=Road+Trip")
            .await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
        assert_eq!(
            json(&mut resp).await["error"],
            "Spotify API error: http status: 403, Insufficient client scope"
        );

        *t.spotify.create_error.lock().unwrap() =
            Some(AppError::Unexpected("spotify request error timed out".to_string()));
        let resp = t
            .post_form("/create_playlist", &cookie, "playlist_name=Road+Trip")
            .await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);
    }

    #[async_std::test]
    async fn add_to_playlist_json_and_form() {
        let t = test_app();
        let cookie = t.logged_in().await;
        t.ctx
            .playlists
            .set_current_playlist(SESSION, "pl-9")
            .await
            .unwrap();

        let mut resp = t
            .post_json(
                "/add_to_playlist",
                &cookie,
                r#"{"track_uri": "spotify:track:abc"}"#,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(json(&mut resp).await, serde_json::json!({"success": true}));

        let resp = t
            .post_form("/add_to_playlist", &cookie, "track_uri=spotify%3Atrack%3Adef")
            .await;
        assert_eq!(resp.status(), StatusCode::Ok);

        assert_eq!(
            *t.spotify.added.lock().unwrap(),
            vec![
                ("pl-9".to_string(), vec!["spotify:track:abc".to_string()]),
                ("pl-9".to_string(), vec!["spotify:track:def".to_string()]),
            ]
        );
    }

    #[async_std::test]
    async fn add_to_playlist_needs_an_active_playlist() {
        let t = test_app();
        let cookie = t.logged_in().await;
        let mut resp = t
            .post_json(
                "/add_to_playlist",
                &cookie,
                r#"{"track_uri": "spotify:track:abc"}"#,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
        assert_eq!(json(&mut resp).await["error"], "No active playlist");
        assert!(t.spotify.added.lock().unwrap().is_empty());
    }

    #[async_std::test]
    async fn add_to_playlist_validation_and_failures() {
        let t = test_app();
        let cookie = t.logged_in().await;
        t.ctx
            .playlists
            .set_current_playlist(SESSION, "pl-9")
            .await
            .unwrap();

        let mut resp = t.post_json("/add_to_playlist", &cookie, "{}").await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
        assert_eq!(json(&mut resp).await["error"], "Missing track_uri");

        let resp = t.post_json("/add_to_playlist", &cookie, "{nope").await;
        assert_eq!(resp.status(), StatusCode::BadRequest);

        *t.spotify.add_error.lock().unwrap() =
            Some(AppError::Provider("http status: 404, Not found.".to_string()));
        let resp = t
            .post_json(
                "/add_to_playlist",
                &cookie,
                r#"{"track_uri": "spotify:track:abc"}"#,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);

        let resp = t
            .send(
                Method::Post,
                "/add_to_playlist",
                None,
                Some((mime::JSON, r#"{"track_uri": "spotify:track:abc"}"#)),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
    }

    #[async_std::test]
    async fn finish_clears_the_current_playlist() {
        let t = test_app();
        let cookie = t.logged_in().await;
        t.ctx
            .playlists
            .set_current_playlist(SESSION, "pl-9")
            .await
            .unwrap();

        for _ in 0..2 {
            let mut resp = t.get("/finish", Some(&cookie)).await;
            assert_eq!(resp.status(), StatusCode::Ok);
            assert_eq!(
                json(&mut resp).await,
                serde_json::json!({"success": true, "message": "Playlist session cleared"})
            );
        }
        assert_eq!(
            t.ctx.playlists.get_current_playlist(SESSION).await.unwrap(),
            None
        );
        // still logged in
        assert!(t.ctx.tokens.is_authenticated(SESSION).await.unwrap());

        let resp = t.get("/finish", None).await;
        assert_eq!(resp.status(), StatusCode::Ok);
    }

    #[async_std::test]
    async fn login_round_trip() {
        let t = test_app();
        let resp = t.get("/", None).await;
        assert_eq!(resp.status(), StatusCode::Ok);

        let resp = t.get("/login", None).await;
        assert_eq!(resp.status(), StatusCode::Found);
        let location = header(&resp, "location");
        let state = location.split("state=").nth(1).unwrap().to_string();

        let resp = t
            .get(&format!("/callback?code=abc&state={}", state), None)
            .await;
        assert_eq!(resp.status(), StatusCode::Found);
        assert_eq!(header(&resp, "location"), "/dashboard");
        let set_cookie = header(&resp, "set-cookie");
        assert!(set_cookie.contains("HttpOnly"));
        let cookie = set_cookie.split(';').next().unwrap().to_string();

        let resp = t.get("/", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Found);
        assert_eq!(header(&resp, "location"), "/dashboard");

        let mut resp = t.get("/dashboard", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let page = resp.body_string().await.unwrap();
        assert!(page.contains("Hello, Test &lt;User&gt;"));
        assert!(page.contains("/add_to_playlist"));

        // the state token is single use
        let resp = t
            .get(&format!("/callback?code=abc&state={}", state), None)
            .await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
    }

    #[async_std::test]
    async fn callback_failures_are_bad_requests() {
        let t = test_app();

        let mut resp = t.get("/callback?code=abc&state=made-up", None).await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
        assert!(resp
            .body_string()
            .await
            .unwrap()
            .starts_with("Authentication failed"));

        let state = new_login_state(&t.ctx).await;
        let resp = t
            .get(&format!("/callback?error=access_denied&state={}", state), None)
            .await;
        assert_eq!(resp.status(), StatusCode::BadRequest);

        let state = new_login_state(&t.ctx).await;
        let resp = t.get(&format!("/callback?state={}", state), None).await;
        assert_eq!(resp.status(), StatusCode::BadRequest);

        t.auth.set_exchange(Err(AppError::Provider(
            "http status: 400, Invalid authorization code".to_string(),
        )));
        let state = new_login_state(&t.ctx).await;
        let mut resp = t
            .get(&format!("/callback?code=abc&state={}", state), None)
            .await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
        assert!(resp.header("set-cookie").is_none());
        assert!(resp
            .body_string()
            .await
            .unwrap()
            .contains("Invalid authorization code"));
    }

    #[async_std::test]
    async fn login_replaces_an_existing_session() {
        let t = test_app();
        let planted = t.logged_in().await;
        t.ctx
            .playlists
            .set_current_playlist(SESSION, "pl-9")
            .await
            .unwrap();

        // a bare token can still lean on the old session's refresh token
        t.auth
            .set_exchange(Ok(crate::spotify::TokenResponse::Bare("bare-access".to_string())));
        let state = new_login_state(&t.ctx).await;
        let resp = t
            .get(&format!("/callback?code=abc&state={}", state), Some(&planted))
            .await;
        assert_eq!(resp.status(), StatusCode::Found);
        let cookie = header(&resp, "set-cookie")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert_ne!(cookie, planted);

        let session = t
            .ctx
            .signer
            .verify(cookie.trim_start_matches("session="))
            .unwrap();
        assert_ne!(session, SESSION);
        assert!(t.ctx.tokens.is_authenticated(&session).await.unwrap());
        assert!(!t.ctx.tokens.is_authenticated(SESSION).await.unwrap());
        assert_eq!(
            t.ctx.playlists.get_current_playlist(SESSION).await.unwrap(),
            None
        );

        let resp = t.get("/search?q=test", Some(&planted)).await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
        let resp = t.get("/search?q=test", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(*t.spotify.tokens_seen.lock().unwrap(), vec!["bare-access"]);
    }

    #[async_std::test]
    async fn unused_login_states_are_swept() {
        let mut config = crate::test_config();
        config.login_state_ttl_seconds = 1;
        let t = test_app_with(config);
        for _ in 0..50 {
            let resp = t.get("/login", None).await;
            assert_eq!(resp.status(), StatusCode::Found);
        }
        assert_eq!(t.ctx.login_states.lock().await.cache_size(), 50);
        async_std::task::sleep(std::time::Duration::from_millis(2100)).await;

        t.get("/login", None).await;
        assert_eq!(t.ctx.login_states.lock().await.cache_size(), 1);
    }

    #[async_std::test]
    async fn dashboard_redirects_anonymous_users_to_login() {
        let t = test_app();
        let resp = t.get("/dashboard", None).await;
        assert_eq!(resp.status(), StatusCode::Found);
        assert_eq!(header(&resp, "location"), "/login");
    }

    #[async_std::test]
    async fn expired_tokens_are_refreshed_on_request() {
        let t = test_app();
        let cookie = t.logged_in().await;
        t.clock.advance(3601);
        let resp = t.get("/search?q=test", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(t.auth.refresh_count(), 1);
        assert_eq!(*t.spotify.tokens_seen.lock().unwrap(), vec!["access-2"]);
    }

    #[async_std::test]
    async fn failed_refresh_forces_a_new_login() {
        let t = test_app();
        let cookie = t.logged_in().await;
        t.auth.set_refresh(Err(AppError::Provider(
            "http status: 400, Refresh token revoked".to_string(),
        )));
        t.clock.advance(3601);

        let mut resp = t.get("/search?q=test", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);
        assert!(json(&mut resp).await["error"]
            .as_str()
            .unwrap()
            .starts_with("token refresh failed"));

        let resp = t.get("/search?q=test", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
    }

    #[async_std::test]
    async fn status_reports_the_version() {
        let t = test_app();
        let mut resp = t.get("/status", None).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(
            json(&mut resp).await,
            serde_json::json!({"ok": "ok", "version": "test"})
        );
    }
}
