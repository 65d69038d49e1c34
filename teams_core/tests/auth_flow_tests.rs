mod common;

use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

use teams_core::auth_flow::{AuthStatus, CallbackParams, CredentialRequest};
use teams_core::session_store::NewSession;
use teams_core::TeamsError;

use common::{app, configured, expired_record, valid_record, FakeProvider};

fn callback(code: &str, state: &str) -> CallbackParams {
    CallbackParams {
        code: Some(code.to_string()),
        state: Some(state.to_string()),
        ..Default::default()
    }
}

fn request<'a>(user_email: &'a str, mcp_session_id: Option<&'a str>) -> CredentialRequest<'a> {
    CredentialRequest {
        user_email,
        mcp_session_id,
        auth_token_email: None,
    }
}

#[tokio::test]
async fn test_callback_binds_the_session_that_started_the_flow() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(configured(dir.path()), Arc::clone(&provider));

    let started = ctx
        .auth
        .start_authorization(Some("alice@example.com"), Some("mcp-1"))
        .unwrap();
    assert!(started.url.contains("client_id=test-client"));
    assert!(started.url.contains("login_hint=alice%40example.com"));
    assert_eq!(
        ctx.auth.status("alice@example.com", Some("mcp-1")),
        AuthStatus::AwaitingCallback
    );

    let user = ctx
        .auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap();
    assert_eq!(user.user_email, "alice@example.com");
    assert_eq!(user.mcp_session_id.as_deref(), Some("mcp-1"));

    let resolved = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .unwrap();
    assert_eq!(
        resolved.record.access_token.as_deref(),
        Some("token-for:alice@example.com")
    );
    assert!(matches!(
        ctx.auth.status("alice@example.com", Some("mcp-1")),
        AuthStatus::Authenticated { .. }
    ));

    // Persisted for later processes.
    assert!(ctx.credentials.load("alice@example.com").unwrap().is_some());
}

#[tokio::test]
async fn test_other_sessions_cannot_use_the_credential() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));

    let started = ctx.auth.start_authorization(None, Some("mcp-1")).unwrap();
    ctx.auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap();

    for session in [Some("mcp-2"), None] {
        let err = ctx
            .auth
            .resolve_credentials(request("alice@example.com", session))
            .await
            .unwrap_err();
        assert!(matches!(err, TeamsError::Authentication(_)), "{:?}", err);
    }
    assert_eq!(
        ctx.auth.status("alice@example.com", Some("mcp-2")),
        AuthStatus::Unauthenticated
    );
}

#[tokio::test]
async fn test_used_state_is_not_a_session_credential() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));

    let started = ctx
        .auth
        .start_authorization(Some("alice@example.com"), Some("mcp-alice"))
        .unwrap();
    ctx.auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap();

    // The state has been in the browser's address bar; presenting it proves nothing.
    let err = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some(started.state.as_str())))
        .await
        .unwrap_err();
    assert!(matches!(err, TeamsError::Authentication(_)), "{:?}", err);
    assert!(ctx
        .auth
        .logout(request("alice@example.com", Some(started.state.as_str())))
        .is_err());
    assert_eq!(
        ctx.auth.status("alice@example.com", Some(started.state.as_str())),
        AuthStatus::Unauthenticated
    );
    assert!(ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-alice")))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_pending_sign_in_is_reported_only_to_its_session() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));
    ctx.auth
        .start_authorization(Some("bob@example.com"), Some("mcp-bob"))
        .unwrap();

    assert_eq!(
        ctx.auth.status("bob@example.com", Some("mcp-bob")),
        AuthStatus::AwaitingCallback
    );
    assert_eq!(
        ctx.auth.status("bob@example.com", Some("some-other-session")),
        AuthStatus::Unauthenticated
    );
    assert_eq!(
        ctx.auth.status("bob@example.com", None),
        AuthStatus::Unauthenticated
    );
}

#[tokio::test]
async fn test_oversized_config_windows_are_capped() {
    let dir = TempDir::new().unwrap();
    let mut config = configured(dir.path());
    config.session.allow_recent_auth = true;
    config.session.recent_auth_window_secs = i64::MAX;
    config.session.service_cache_ttl_secs = i64::MAX;
    config.session.oauth_state_ttl_secs = i64::MAX;
    let ctx = app(config, Arc::new(FakeProvider::default()));

    ctx.sessions
        .store_session(NewSession::new("alice@example.com", valid_record("alice")))
        .unwrap();
    assert!(ctx
        .auth
        .resolve_credentials(request("alice@example.com", None))
        .await
        .is_ok());
    let started = ctx.auth.start_authorization(None, Some("mcp-1")).unwrap();
    assert!(ctx
        .auth
        .handle_callback(callback("carol@example.com", &started.state))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_auth_token_email_must_match_requested_user() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));
    ctx.sessions
        .store_session(NewSession::new("alice@example.com", valid_record("alice")))
        .unwrap();

    let own = CredentialRequest {
        user_email: "alice@example.com",
        mcp_session_id: None,
        auth_token_email: Some("Alice@Example.com"),
    };
    assert!(ctx.auth.resolve_credentials(own).await.is_ok());

    let foreign = CredentialRequest {
        user_email: "alice@example.com",
        mcp_session_id: None,
        auth_token_email: Some("mallory@example.com"),
    };
    assert!(ctx.auth.resolve_credentials(foreign).await.is_err());
}

#[tokio::test]
async fn test_state_is_single_use() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(configured(dir.path()), Arc::clone(&provider));

    let started = ctx.auth.start_authorization(None, None).unwrap();
    ctx.auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap();
    let replay = ctx
        .auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap_err();
    assert!(matches!(replay, TeamsError::Authentication(_)));
    assert_eq!(
        provider.exchanges.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_callback_rejects_provider_error_and_missing_params() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));

    let denied = CallbackParams {
        error: Some("access_denied".into()),
        error_description: Some("The user declined consent".into()),
        ..Default::default()
    };
    let err = ctx.auth.handle_callback(denied).await.unwrap_err();
    assert!(err.to_string().contains("access_denied"));

    let no_state = CallbackParams {
        code: Some("alice@example.com".into()),
        ..Default::default()
    };
    assert!(matches!(
        ctx.auth.handle_callback(no_state).await,
        Err(TeamsError::InvalidInput(_))
    ));

    let unknown_state = callback("alice@example.com", "never-issued");
    assert!(matches!(
        ctx.auth.handle_callback(unknown_state).await,
        Err(TeamsError::Authentication(_))
    ));
}

#[tokio::test]
async fn test_unconfigured_client_fails_before_contacting_provider() {
    let dir = TempDir::new().unwrap();
    let mut config = configured(dir.path());
    config.oauth.client_secret = None;
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(config, Arc::clone(&provider));

    assert!(matches!(
        ctx.auth.start_authorization(Some("alice@example.com"), None),
        Err(TeamsError::Configuration(_))
    ));
    assert!(matches!(
        ctx.auth
            .handle_callback(callback("alice@example.com", "any"))
            .await,
        Err(TeamsError::Configuration(_))
    ));
    assert_eq!(
        provider.exchanges.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_once_and_persisted() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(configured(dir.path()), Arc::clone(&provider));
    ctx.sessions
        .store_session(
            NewSession::new("alice@example.com", expired_record("stale")).with_mcp_session_id("mcp-1"),
        )
        .unwrap();
    assert_eq!(
        ctx.auth.status("alice@example.com", Some("mcp-1")),
        AuthStatus::Expired { refreshable: true }
    );

    let first = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .unwrap();
    let second = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .unwrap();

    assert_eq!(provider.refresh_count(), 1);
    assert_eq!(first.record.access_token, second.record.access_token);
    assert_eq!(
        first.record.access_token.as_deref(),
        Some("refreshed-1-for:alice@example.com")
    );

    let on_disk = ctx.credentials.load("alice@example.com").unwrap().unwrap();
    assert_eq!(on_disk.access_token, first.record.access_token);
    assert!(on_disk.is_valid());
}

#[tokio::test]
async fn test_concurrent_refreshes_both_succeed_and_last_write_wins() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(configured(dir.path()), Arc::clone(&provider));
    ctx.sessions
        .store_session(
            NewSession::new("alice@example.com", expired_record("stale")).with_mcp_session_id("mcp-1"),
        )
        .unwrap();

    let results = join_all((0..2).map(|_| {
        ctx.auth
            .resolve_credentials(request("alice@example.com", Some("mcp-1")))
    }))
    .await;

    let tokens: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().record.access_token.unwrap())
        .collect();
    assert!((1..=2).contains(&provider.refresh_count()));

    let on_disk = ctx.credentials.load("alice@example.com").unwrap().unwrap();
    let stored = on_disk.access_token.unwrap();
    assert!(tokens.contains(&stored), "{} not in {:?}", stored, tokens);
    let in_memory = ctx
        .sessions
        .get_credentials_by_mcp_session("mcp-1")
        .unwrap();
    assert_eq!(in_memory.access_token.as_deref(), Some(stored.as_str()));
    assert!(in_memory.is_valid());
}

#[tokio::test]
async fn test_expired_without_refresh_token_requires_sign_in() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(configured(dir.path()), Arc::clone(&provider));
    let mut record = expired_record("stale");
    record.refresh_token = None;
    ctx.sessions
        .store_session(NewSession::new("alice@example.com", record).with_mcp_session_id("mcp-1"))
        .unwrap();

    let err = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .unwrap_err();
    assert!(matches!(err, TeamsError::Authentication(_)));
    assert_eq!(provider.refresh_count(), 0);
}

#[tokio::test]
async fn test_rejected_refresh_surfaces_reauth_error() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider {
        reject_refresh: true,
        ..Default::default()
    });
    let ctx = app(configured(dir.path()), provider);
    ctx.sessions
        .store_session(
            NewSession::new("alice@example.com", expired_record("stale")).with_mcp_session_id("mcp-1"),
        )
        .unwrap();

    let err = ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .unwrap_err();
    match err {
        TeamsError::TokenRefresh { user_email, .. } => assert_eq!(user_email, "alice@example.com"),
        other => panic!("expected TokenRefresh, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recent_auth_fallback_is_opt_in() {
    let dir = TempDir::new().unwrap();

    let strict = app(configured(dir.path()), Arc::new(FakeProvider::default()));
    strict
        .sessions
        .store_session(NewSession::new("alice@example.com", valid_record("alice")))
        .unwrap();
    assert!(strict
        .auth
        .resolve_credentials(request("alice@example.com", Some("fresh-session")))
        .await
        .is_err());

    let mut config = configured(dir.path());
    config.session.allow_recent_auth = true;
    let lenient = app(config, Arc::new(FakeProvider::default()));
    lenient
        .sessions
        .store_session(NewSession::new("alice@example.com", valid_record("alice")))
        .unwrap();
    assert!(lenient
        .auth
        .resolve_credentials(request("alice@example.com", Some("fresh-session")))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_single_user_mode_uses_stored_credential() {
    let dir = TempDir::new().unwrap();
    let mut config = configured(dir.path());
    config.single_user = true;
    let ctx = app(config, Arc::new(FakeProvider::default()));

    let missing = ctx
        .auth
        .resolve_credentials(request("anyone@example.com", None))
        .await
        .unwrap_err();
    assert!(matches!(missing, TeamsError::Authentication(_)));

    ctx.credentials
        .save("bob@example.com", &valid_record("bob"))
        .unwrap();
    let resolved = ctx
        .auth
        .resolve_credentials(request("someone-else@example.com", None))
        .await
        .unwrap();
    assert_eq!(resolved.user_email, "bob@example.com");
    assert_eq!(resolved.record.access_token.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_single_user_mode_refreshes_and_persists() {
    let dir = TempDir::new().unwrap();
    let mut config = configured(dir.path());
    config.single_user = true;
    let provider = Arc::new(FakeProvider::default());
    let ctx = app(config, Arc::clone(&provider));
    ctx.credentials
        .save("bob@example.com", &expired_record("bob"))
        .unwrap();

    let resolved = ctx
        .auth
        .resolve_credentials(request("", None))
        .await
        .unwrap();
    assert_eq!(provider.refresh_count(), 1);
    let on_disk = ctx.credentials.load("bob@example.com").unwrap().unwrap();
    assert_eq!(on_disk.access_token, resolved.record.access_token);
}

#[tokio::test]
async fn test_logout_requires_ownership_and_removes_everything() {
    let dir = TempDir::new().unwrap();
    let ctx = app(configured(dir.path()), Arc::new(FakeProvider::default()));
    let started = ctx.auth.start_authorization(None, Some("mcp-1")).unwrap();
    ctx.auth
        .handle_callback(callback("alice@example.com", &started.state))
        .await
        .unwrap();

    assert!(matches!(
        ctx.auth.logout(request("alice@example.com", Some("mcp-2"))),
        Err(TeamsError::Authentication(_))
    ));
    assert!(ctx.sessions.has_session("alice@example.com"));

    assert!(ctx
        .auth
        .logout(request("alice@example.com", Some("mcp-1")))
        .unwrap());
    assert!(!ctx.sessions.has_session("alice@example.com"));
    assert!(ctx.sessions.get_user_by_mcp_session("mcp-1").is_none());
    assert!(ctx.credentials.load("alice@example.com").unwrap().is_none());
    assert!(ctx
        .auth
        .resolve_credentials(request("alice@example.com", Some("mcp-1")))
        .await
        .is_err());
}
