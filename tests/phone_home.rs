//! Phone-home listener contract, exercised over real HTTP.

use std::time::Duration;

use virtci::error::ProvisionError;
use virtci::readiness::{PhoneHomeListener, ReadinessSignal};

fn post_form(url: &str, fields: &[(&str, &str)]) -> u16 {
    match ureq::post(url).send_form(fields) {
        Ok(resp) => resp.status(),
        Err(ureq::Error::Status(code, _)) => code,
        Err(err) => panic!("transport error: {err}"),
    }
}

async fn post(url: String, fields: Vec<(&'static str, &'static str)>) -> u16 {
    tokio::task::spawn_blocking(move || post_form(&url, &fields))
        .await
        .expect("join")
}

#[tokio::test]
async fn valid_callback_satisfies_the_latch() {
    let listener = PhoneHomeListener::bind("vm1", "127.0.0.1").await.expect("bind");
    let url = listener.callback_url();

    let status = post(url, vec![("hostname", "vm1"), ("instance_id", "i-1")]).await;
    assert_eq!(status, 200);

    listener
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("latch satisfied");
}

#[tokio::test]
async fn repeat_callback_after_the_first_is_a_noop() {
    let listener = PhoneHomeListener::bind("vm1", "127.0.0.1").await.expect("bind");
    let url = listener.callback_url();

    assert_eq!(post(url.clone(), vec![("hostname", "vm1")]).await, 200);
    assert_eq!(post(url, vec![("hostname", "vm1")]).await, 200);

    listener
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("still satisfied");
}

#[tokio::test]
async fn mismatched_hostname_never_satisfies_the_latch() {
    let listener = PhoneHomeListener::bind("vm1", "127.0.0.1").await.expect("bind");
    let url = listener.callback_url();

    assert_eq!(post(url.clone(), vec![("hostname", "intruder")]).await, 403);
    assert_eq!(post(url, vec![]).await, 403);

    let err = listener
        .wait_ready(Duration::from_millis(100))
        .await
        .expect_err("latch must stay unsatisfied");
    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::ReadinessTimeout { .. })
    ));
}

#[tokio::test]
async fn other_paths_are_not_found() {
    let listener = PhoneHomeListener::bind("vm1", "127.0.0.1").await.expect("bind");
    let url = format!(
        "http://127.0.0.1:{}/metadata",
        listener.local_addr().port()
    );

    assert_eq!(post(url, vec![("hostname", "vm1")]).await, 404);
}
