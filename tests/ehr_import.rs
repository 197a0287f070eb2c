//! Directory imports through `/ingest/ehr` against PostgreSQL. Run with
//! `DATABASE_URL` set and `cargo test -- --ignored`.

mod support;

use std::path::{Path, PathBuf};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::test;
use diesel::prelude::*;
use medivault::schema::users;
use medivault::{build_app, db};
use serde_json::{json, Value};

use support::{bearer, database_state_with, limiter, registration, unique_email};

fn import_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("medivault-ehr-{}", uuid::Uuid::new_v4().simple()));
    let export = root.join("Requested Record");
    std::fs::create_dir_all(export.join("EHITables")).unwrap();
    std::fs::create_dir_all(export.join("Rich Text")).unwrap();
    std::fs::create_dir_all(export.join("Media")).unwrap();
    std::fs::write(
        export.join("EHITables/PAT_ENC.tsv"),
        "PAT_ENC_CSN_ID\tDEPARTMENT\n7001\tCardiology\n",
    )
    .unwrap();
    std::fs::write(
        export.join("Rich Text/visit.rtf"),
        r"{\rtf1\ansi{\fonttbl{\f0 Arial;}}\f0 Follow-up in six months.\par}",
    )
    .unwrap();
    std::fs::write(export.join("Media/ecg.pdf"), b"%PDF-1.7").unwrap();
    root
}

async fn wait_for(path: &Path) {
    for _ in 0..50 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} was never written", path.display());
}

#[actix_web::test]
#[ignore = "requires DATABASE_URL"]
async fn admins_import_inside_the_root_only() {
    let root = import_root();
    let configured = root.clone();
    let state = database_state_with(move |settings| settings.ehr_import_root = Some(configured)).await;
    let pool = state.pool.clone();
    let app = test::init_service(build_app(state, limiter())).await;

    let email = unique_email();
    let req = test::TestRequest::post()
        .uri("/auth/register")
        .set_json(registration(&email))
        .to_request();
    let session: Value = test::call_and_read_body_json(&app, req).await;
    let token = session["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/ingest/ehr")
        .insert_header(bearer(&token))
        .set_json(json!({ "input_dir": "Requested Record" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    db::run(&pool, move |conn| {
        diesel::update(users::table.filter(users::email.eq(email)))
            .set(users::role.eq("ADMIN"))
            .execute(conn)?;
        Ok(())
    })
    .await
    .unwrap();

    let req = test::TestRequest::post()
        .uri("/ingest/ehr")
        .insert_header(bearer(&token))
        .set_json(json!({ "input_dir": "Requested Record" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let started: Value = test::read_body_json(resp).await;
    assert_eq!(started["layout"], "ehi_export");

    let out = root.join("Requested Record_Markdown");
    wait_for(&out.join("Media_Text/media_index.md")).await;
    wait_for(&out.join("RichText_Text/visit.txt")).await;
    wait_for(&out.join("EHITables_Markdown/PAT_ENC.md")).await;
    let table = std::fs::read_to_string(out.join("EHITables_Markdown/PAT_ENC.md")).unwrap();
    assert!(table.contains("| 7001 | Cardiology |"));

    let rejected = [
        json!({ "input_dir": "../" }),
        json!({ "input_dir": "/etc" }),
        json!({ "input_dir": "Requested Record", "output_dir": "../escaped" }),
        json!({ "input_dir": "Requested Record", "schema_json": "/etc/passwd" }),
        json!({ "input_dir": "missing" }),
    ];
    for body in rejected {
        let req = test::TestRequest::post()
            .uri("/ingest/ehr")
            .insert_header(bearer(&token))
            .set_json(&body)
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST,
            "{body}"
        );
    }

    let req = test::TestRequest::post()
        .uri("/ingest/ehr")
        .insert_header(bearer(&token))
        .set_json(json!({ "input_dir": "." }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let started: Value = test::read_body_json(resp).await;
    let output_dir = PathBuf::from(started["output_dir"].as_str().unwrap());
    assert!(output_dir.starts_with(root.canonicalize().unwrap()));
}
