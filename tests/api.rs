use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use course_server::{
    admin,
    api::{self, AppState, SharedState, payments::SIGNATURE_HEADER},
    config::{Config, Secrets},
    db,
    signing::Signer,
    user::{self, NewUser, Role},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use tower_sessions::{MemoryStore, SessionManagerLayer};

const WEBHOOK_SECRET: &str = "webhook-secret";
const BOUNDARY: &str = "course-server-boundary";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake image";

struct TestApp {
    router: Router,
    state: SharedState,
    _media: TempDir,
}

struct Reply {
    status: StatusCode,
    cookie: Option<String>,
    json: Value,
}

async fn app() -> TestApp {
    let database = db::memory().await.unwrap();
    let media = tempfile::tempdir().unwrap();
    let config = Config {
        media_root: media.path().to_path_buf(),
        secrets: Secrets {
            media_signing: "media-secret".to_string(),
            payment_webhook: WEBHOOK_SECRET.to_string(),
        },
        ..Config::default()
    };
    let state = Arc::new(AppState::new(database, config).await.unwrap());
    let router = api::router(state.clone())
        .layer(SessionManagerLayer::new(MemoryStore::default()).with_secure(false));
    TestApp {
        router,
        state,
        _media: media,
    }
}

impl TestApp {
    async fn call(&self, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::to_string);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, cookie, body.to_vec())
    }

    async fn send(&self, method: Method, uri: &str, cookie: Option<&str>, body: Option<Value>) -> Reply {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let (status, cookie, body) = self.call(request).await;
        Reply {
            status,
            cookie,
            json: serde_json::from_slice(&body).unwrap_or(Value::Null),
        }
    }

    async fn upload(&self, uri: &str, cookie: &str, filename: &str, content_type: &str, bytes: &[u8], fields: &[(&str, &str)]) -> Reply {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::COOKIE, cookie)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, cookie, body) = self.call(request).await;
        Reply {
            status,
            cookie,
            json: serde_json::from_slice(&body).unwrap_or(Value::Null),
        }
    }

    async fn login(&self, uri: &str, email: &str, password: &str) -> String {
        let reply = self
            .send(
                Method::POST,
                uri,
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.json);
        reply.cookie.expect("login sets a session cookie")
    }

    async fn user(&self, email: &str, role: Role, verified: bool) -> (i64, String) {
        let id = user::create_user(
            &self.state.database,
            NewUser {
                name: email.split('@').next().unwrap().to_string(),
                email: email.to_string(),
                password: "password-123".to_string(),
                role,
                is_verified: verified,
            },
        )
        .await
        .unwrap();
        let cookie = self.login("/api/auth/login", email, "password-123").await;
        (id, cookie)
    }

    async fn admin(&self) -> String {
        admin::create_admin(&self.state.database, "Root", "root@example.com", "root-password", true)
            .await
            .unwrap();
        self.login("/api/admin/login", "root@example.com", "root-password")
            .await
    }

    /// A published paid course with one video lesson, built through the HTTP API.
    async fn published_course(&self, admin: &str, professor_id: i64, professor: &str) -> (i64, i64, String) {
        let category = self
            .send(
                Method::POST,
                "/api/admin/categories",
                Some(admin),
                Some(json!({ "name": "Systems" })),
            )
            .await;
        assert_eq!(category.status, StatusCode::CREATED);
        let course = self
            .send(
                Method::POST,
                "/api/admin/courses",
                Some(admin),
                Some(json!({
                    "title": "Async Rust",
                    "description": "Futures from the ground up",
                    "price": 4900,
                    "category_id": category.json["id"],
                    "creator_id": professor_id,
                })),
            )
            .await;
        assert_eq!(course.status, StatusCode::CREATED, "{}", course.json);
        let course_id = course.json["id"].as_i64().unwrap();
        let slug = course.json["slug"].as_str().unwrap().to_string();

        let thumbnail = self
            .upload(
                &format!("/api/admin/courses/{course_id}/thumbnail"),
                admin,
                "cover.png",
                "image/png",
                PNG,
                &[],
            )
            .await;
        assert_eq!(thumbnail.status, StatusCode::OK, "{}", thumbnail.json);

        let lesson = self
            .send(
                Method::POST,
                &format!("/api/professor/courses/{course_id}/lessons"),
                Some(professor),
                Some(json!({ "title": "Polling" })),
            )
            .await;
        assert_eq!(lesson.status, StatusCode::CREATED, "{}", lesson.json);
        let lesson_id = lesson.json["id"].as_i64().unwrap();

        let not_ready = self
            .send(
                Method::POST,
                &format!("/api/admin/courses/{course_id}/publish"),
                Some(admin),
                None,
            )
            .await;
        assert_eq!(not_ready.status, StatusCode::BAD_REQUEST);
        assert_eq!(not_ready.json["code"], "BAD_REQUEST");

        let video = self
            .upload(
                &format!("/api/professor/lessons/{lesson_id}/video"),
                professor,
                "polling.mp4",
                "video/mp4",
                b"not really a video",
                &[("duration_secs", "600")],
            )
            .await;
        assert_eq!(video.status, StatusCode::OK, "{}", video.json);
        assert_eq!(video.json["video_duration_secs"], 600);

        let published = self
            .send(
                Method::POST,
                &format!("/api/admin/courses/{course_id}/publish"),
                Some(admin),
                None,
            )
            .await;
        assert_eq!(published.status, StatusCode::OK, "{}", published.json);
        (course_id, lesson_id, slug)
    }
}

#[tokio::test]
async fn extractors_enforce_roles() {
    let app = app().await;
    let anonymous = app
        .send(Method::GET, "/api/student/enrollments", None, None)
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.json["code"], "UNAUTHORIZED");

    let (_, student) = app.user("student@example.com", Role::Student, false).await;
    let mine = app
        .send(Method::GET, "/api/student/enrollments", Some(&student), None)
        .await;
    assert_eq!(mine.status, StatusCode::OK);
    let professor_only = app
        .send(Method::GET, "/api/professor/courses", Some(&student), None)
        .await;
    assert_eq!(professor_only.status, StatusCode::FORBIDDEN);
    let admin_only = app
        .send(Method::GET, "/api/admin/stats", Some(&student), None)
        .await;
    assert_eq!(admin_only.status, StatusCode::UNAUTHORIZED);

    let (_, unverified) = app
        .user("new-prof@example.com", Role::Professor, false)
        .await;
    let pending = app
        .send(Method::GET, "/api/professor/courses", Some(&unverified), None)
        .await;
    assert_eq!(pending.status, StatusCode::FORBIDDEN);

    let admin = app.admin().await;
    let stats = app
        .send(Method::GET, "/api/admin/stats", Some(&admin), None)
        .await;
    assert_eq!(stats.status, StatusCode::OK);
    assert_eq!(stats.json["students"], 1);
    assert_eq!(stats.json["professors"], 1);
}

#[tokio::test]
async fn register_login_and_logout() {
    let app = app().await;
    let created = app
        .send(
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "name": "Ada", "email": "Ada@Example.com", "password": "lovelace-1815" })),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.json["email"], "ada@example.com");
    assert_eq!(created.json["role"], "student");

    let duplicate = app
        .send(
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "name": "Ada", "email": "ada@example.com", "password": "lovelace-1815" })),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let wrong = app
        .send(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "ada@example.com", "password": "nope-nope" })),
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let cookie = app
        .login("/api/auth/login", "ada@example.com", "lovelace-1815")
        .await;
    let me = app.send(Method::GET, "/api/auth/me", Some(&cookie), None).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.json["name"], "Ada");

    let logout = app
        .send(Method::POST, "/api/auth/logout", Some(&cookie), None)
        .await;
    assert_eq!(logout.status, StatusCode::NO_CONTENT);
    let after = app.send(Method::GET, "/api/auth/me", Some(&cookie), None).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn catalog_and_signed_media() {
    let app = app().await;
    let admin = app.admin().await;
    let (professor_id, professor) = app
        .user("prof@example.com", Role::Professor, true)
        .await;
    let (_, lesson_id, slug) = app.published_course(&admin, professor_id, &professor).await;

    let listed = app
        .send(Method::GET, "/api/public/courses", None, None)
        .await;
    assert_eq!(listed.status, StatusCode::OK);
    assert_eq!(listed.json.as_array().unwrap().len(), 1);
    let thumbnail = listed.json[0]["thumbnail_url"].as_str().unwrap().to_string();
    assert!(listed.json[0].get("thumbnail_key").is_none());

    let page = app
        .send(Method::GET, &format!("/api/public/courses/{slug}"), None, None)
        .await;
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.json["total_duration_secs"], 600);
    assert_eq!(page.json["lessons"][0]["has_video"], true);

    let locked = app
        .send(Method::GET, &format!("/api/public/lessons/{lesson_id}"), None, None)
        .await;
    assert_eq!(locked.status, StatusCode::UNAUTHORIZED);

    let (status, _, bytes) = app
        .call(Request::get(&thumbnail).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, PNG);

    let forged = thumbnail.replace("signature=", "signature=00");
    let (status, _, _) = app
        .call(Request::get(&forged).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let docs = app.send(Method::GET, "/api-docs/openapi.json", None, None).await;
    assert_eq!(docs.status, StatusCode::OK);
    assert!(docs.json["paths"]["/api/payments/webhook"].is_object());
}

#[tokio::test]
async fn paid_checkout_through_webhook() {
    let app = app().await;
    let admin = app.admin().await;
    let (professor_id, professor) = app
        .user("prof@example.com", Role::Professor, true)
        .await;
    let (course_id, lesson_id, _) = app.published_course(&admin, professor_id, &professor).await;
    let (_, student) = app.user("student@example.com", Role::Student, false).await;

    let free = app
        .send(
            Method::POST,
            &format!("/api/student/courses/{course_id}/enroll"),
            Some(&student),
            None,
        )
        .await;
    assert_eq!(free.status, StatusCode::BAD_REQUEST);

    let started = app
        .send(
            Method::POST,
            &format!("/api/student/courses/{course_id}/checkout"),
            Some(&student),
            Some(json!({})),
        )
        .await;
    assert_eq!(started.status, StatusCode::CREATED, "{}", started.json);
    assert_eq!(started.json["order"]["status"], "pending");
    assert_eq!(started.json["order"]["total"], 4900);
    let reference = started.json["payment_reference"].as_str().unwrap().to_string();

    let event = json!({ "reference": reference, "status": "succeeded", "amount": 4900 }).to_string();
    let webhook = |signature: String| {
        Request::post("/api/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(event.clone()))
            .unwrap()
    };
    let (status, _, _) = app.call(webhook("deadbeef".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = Signer::webhook(WEBHOOK_SECRET).sign(event.as_bytes());
    let (status, _, body) = app.call(webhook(signature.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let paid: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(paid["status"], "paid");
    // replayed callbacks change nothing
    let (status, _, _) = app.call(webhook(signature)).await;
    assert_eq!(status, StatusCode::OK);

    let enrollments = app
        .send(Method::GET, "/api/student/enrollments", Some(&student), None)
        .await;
    assert_eq!(enrollments.json.as_array().unwrap().len(), 1);
    assert_eq!(enrollments.json[0]["price_paid"], 4900);

    let lesson = app
        .send(
            Method::GET,
            &format!("/api/student/lessons/{lesson_id}"),
            Some(&student),
            None,
        )
        .await;
    assert_eq!(lesson.status, StatusCode::OK);
    assert!(lesson.json["video_url"].as_str().unwrap().starts_with("/media/videos/"));

    let progress = app
        .send(
            Method::POST,
            &format!("/api/student/lessons/{lesson_id}/progress"),
            Some(&student),
            Some(json!({ "watch_secs": 600, "position_secs": 600, "completed": true })),
        )
        .await;
    assert_eq!(progress.status, StatusCode::OK, "{}", progress.json);
    assert_eq!(progress.json["completion_rate"], 100.0);

    let students = app
        .send(
            Method::GET,
            &format!("/api/professor/courses/{course_id}/students"),
            Some(&professor),
            None,
        )
        .await;
    assert_eq!(students.json[0]["progress_percent"], 100.0);

    let again = app
        .send(
            Method::POST,
            &format!("/api/student/courses/{course_id}/checkout"),
            Some(&student),
            Some(json!({})),
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let audit = app
        .send(Method::GET, "/api/admin/audit-logs?entity_type=course", Some(&admin), None)
        .await;
    let actions: Vec<&str> = audit
        .json
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, ["publish", "thumbnail", "create"]);
}

#[tokio::test]
async fn coupon_covering_the_price_enrolls_immediately() {
    let app = app().await;
    let admin = app.admin().await;
    let (professor_id, professor) = app
        .user("prof@example.com", Role::Professor, true)
        .await;
    let (course_id, _, _) = app.published_course(&admin, professor_id, &professor).await;
    let coupon = app
        .send(
            Method::POST,
            "/api/admin/coupons",
            Some(&admin),
            Some(json!({
                "code": "launch-week",
                "discount_type": "percentage",
                "discount_value": 100,
                "max_uses": 1,
                "course_ids": [course_id],
            })),
        )
        .await;
    assert_eq!(coupon.status, StatusCode::CREATED, "{}", coupon.json);
    assert_eq!(coupon.json["code"], "LAUNCH-WEEK");

    let (_, student) = app.user("student@example.com", Role::Student, false).await;
    let preview = app
        .send(
            Method::GET,
            &format!("/api/student/coupons/launch-week?course_id={course_id}"),
            Some(&student),
            None,
        )
        .await;
    assert_eq!(preview.status, StatusCode::OK, "{}", preview.json);
    assert_eq!(preview.json["final_price"], 0);

    let started = app
        .send(
            Method::POST,
            &format!("/api/student/courses/{course_id}/checkout"),
            Some(&student),
            Some(json!({ "coupon_code": "LAUNCH-WEEK" })),
        )
        .await;
    assert_eq!(started.status, StatusCode::CREATED, "{}", started.json);
    assert_eq!(started.json["order"]["status"], "paid");
    assert!(started.json["payment_reference"].is_null());
    assert!(started.json["enrollment_id"].is_i64());

    let (_, other) = app.user("other@example.com", Role::Student, false).await;
    let exhausted = app
        .send(
            Method::POST,
            &format!("/api/student/courses/{course_id}/checkout"),
            Some(&other),
            Some(json!({ "coupon_code": "LAUNCH-WEEK" })),
        )
        .await;
    assert_eq!(exhausted.status, StatusCode::BAD_REQUEST);

    let coupon_id = coupon.json["id"].as_i64().unwrap();
    let delete = app
        .send(
            Method::DELETE,
            &format!("/api/admin/coupons/{coupon_id}"),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(delete.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn disabled_admin_loses_access() {
    let app = app().await;
    let root = app.admin().await;
    let created = app
        .send(
            Method::POST,
            "/api/admin/admins",
            Some(&root),
            Some(json!({
                "name": "Staff",
                "email": "staff@example.com",
                "password": "staff-password",
            })),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.json);
    let staff_id = created.json["id"].as_i64().unwrap();
    let staff = app
        .login("/api/admin/login", "staff@example.com", "staff-password")
        .await;

    let category = app
        .send(
            Method::POST,
            "/api/admin/categories",
            Some(&staff),
            Some(json!({ "name": "Databases" })),
        )
        .await;
    assert_eq!(category.status, StatusCode::CREATED);
    let not_super = app
        .send(Method::GET, "/api/admin/admins", Some(&staff), None)
        .await;
    assert_eq!(not_super.status, StatusCode::FORBIDDEN);

    let disabled = app
        .send(
            Method::PUT,
            &format!("/api/admin/admins/{staff_id}/active"),
            Some(&root),
            Some(json!({ "active": false })),
        )
        .await;
    assert_eq!(disabled.status, StatusCode::OK, "{}", disabled.json);
    assert_eq!(disabled.json["is_active"], false);

    // the session issued before the change no longer works
    let refused = app
        .send(
            Method::POST,
            "/api/admin/categories",
            Some(&staff),
            Some(json!({ "name": "Networks" })),
        )
        .await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
    let me = app.send(Method::GET, "/api/admin/me", Some(&staff), None).await;
    assert_eq!(me.status, StatusCode::FORBIDDEN);

    let categories = app
        .send(Method::GET, "/api/admin/categories", Some(&root), None)
        .await;
    assert_eq!(categories.json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_course_edit_leaves_no_trace() {
    let app = app().await;
    let admin = app.admin().await;
    let (professor_id, professor) = app
        .user("prof@example.com", Role::Professor, true)
        .await;
    let (course_id, _, _) = app.published_course(&admin, professor_id, &professor).await;

    let broken = app
        .send(
            Method::PATCH,
            &format!("/api/admin/courses/{course_id}"),
            Some(&admin),
            Some(json!({ "price": 0 })),
        )
        .await;
    assert_eq!(broken.status, StatusCode::BAD_REQUEST, "{}", broken.json);

    let course = app
        .send(
            Method::GET,
            &format!("/api/admin/courses/{course_id}"),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(course.json["price"], 4900);
    assert_eq!(course.json["is_published"], true);

    let logs = app
        .send(
            Method::GET,
            "/api/admin/audit-logs?entity_type=course",
            Some(&admin),
            None,
        )
        .await;
    let actions: Vec<&str> = logs
        .json
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, ["publish", "thumbnail", "create"]);

    let second = app
        .send(
            Method::POST,
            "/api/admin/categories",
            Some(&admin),
            Some(json!({ "name": "Systems!" })),
        )
        .await;
    assert_eq!(second.status, StatusCode::CREATED, "{}", second.json);
    assert_eq!(second.json["slug"], "systems-2");
}
