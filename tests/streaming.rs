//! End-to-end streaming: sealed objects served over the loopback gateway.

use std::io::Write;
use std::sync::Arc;

use strombox::{MasterKey, Strombox};

fn init_logging() {
    let _ = env_logger::Builder::new()
        .parse_default_env()
        .is_test(true)
        .try_init();
}

/// A deterministic payload that makes off-by-one slicing visible.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index * 31 % 251) as u8).collect()
}

struct Fixture {
    // Keeps the embedded server alive for the duration of the test.
    _vault: Arc<Strombox>,
    url: String,
    body: Vec<u8>,
    // Kept alive for the duration of the test.
    _directory: tempfile::TempDir,
}

fn fixture(name: &str, len: usize) -> Fixture {
    init_logging();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join(name);
    let vault = Arc::new(Strombox::new(MasterKey::random()));
    let body = payload(len);

    let mut writer = vault.open_writer(&path).unwrap();
    writer.write_all(&body).unwrap();
    writer.finish().unwrap();

    let url = vault.stream_url(&path).unwrap().to_string();
    Fixture {
        _vault: vault,
        url,
        body,
        _directory: directory,
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::new()
}

#[test]
fn whole_object_is_a_200() {
    let fixture = fixture("clip.mp4", 1000);
    let response = client().get(&fixture.url).send().unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-length"],
        fixture.body.len().to_string().as_str()
    );
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert!(response.headers().contains_key("last-modified"));
    assert!(response.headers().contains_key("server"));
    assert!(!response.headers().contains_key("content-range"));
    assert_eq!(response.bytes().unwrap().as_ref(), fixture.body.as_slice());
}

/// The worked example: 1,000 bytes, `Range: bytes=500-`.
#[test]
fn skip_request_is_a_206() {
    let fixture = fixture("clip.mp4", 1000);
    let response = client()
        .get(&fixture.url)
        .header("range", "bytes=500-")
        .send()
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-length"], "500");
    assert_eq!(response.headers()["content-range"], "bytes 500-999/1000");
    assert_eq!(response.bytes().unwrap().as_ref(), &fixture.body[500..]);
}

#[test]
fn offsets_across_cipher_segments() {
    // Several AEAD segments; offsets land before, on, and after the
    // boundaries.
    let fixture = fixture("long.mp4", 10_000);
    for offset in [1_usize, 4_095, 4_096, 4_097, 8_192, 9_999] {
        let response = client()
            .get(&fixture.url)
            .header("range", format!("bytes={offset}-"))
            .send()
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::PARTIAL_CONTENT,
            "offset {offset}"
        );
        assert_eq!(
            response.headers()["content-length"],
            (10_000 - offset).to_string().as_str()
        );
        assert_eq!(
            response.headers()["content-range"],
            format!("bytes {offset}-9999/10000").as_str()
        );
        assert_eq!(
            response.bytes().unwrap().as_ref(),
            &fixture.body[offset..],
            "offset {offset}"
        );
    }
}

/// A zero offset is the whole object; the range header degenerates to a 200.
#[test]
fn zero_offset_serves_everything() {
    let fixture = fixture("clip.mp4", 1000);
    let response = client()
        .get(&fixture.url)
        .header("range", "bytes=0-")
        .send()
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().unwrap().as_ref(), fixture.body.as_slice());
}

#[test]
fn malformed_range_serves_everything() {
    let fixture = fixture("clip.mp4", 1000);
    let response = client()
        .get(&fixture.url)
        .header("range", "bytes=oops-")
        .send()
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().unwrap().len(), 1000);
}

#[test]
fn offset_past_the_end_is_an_empty_tail() {
    let fixture = fixture("clip.mp4", 1000);
    let response = client()
        .get(&fixture.url)
        .header("range", "bytes=2000-")
        .send()
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-length"], "0");
    assert!(response.bytes().unwrap().is_empty());
}

#[test]
fn empty_object_has_size_zero() {
    let fixture = fixture("empty.mp4", 0);
    let response = client().get(&fixture.url).send().unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "0");
    assert!(response.bytes().unwrap().is_empty());
}

/// Two identifiers streamed concurrently never bleed into each other.
#[test]
fn concurrent_streams_stay_independent() {
    init_logging();
    let directory = tempfile::tempdir().unwrap();
    let vault = Arc::new(Strombox::new(MasterKey::random()));

    let mut urls = Vec::new();
    let mut bodies = Vec::new();
    for (name, seed) in [("a.mp4", 3_usize), ("b.mp4", 7)] {
        let path = directory.path().join(name);
        let body: Vec<u8> = (0..60_000).map(|i| (i * seed % 241) as u8).collect();
        let mut writer = vault.open_writer(&path).unwrap();
        writer.write_all(&body).unwrap();
        writer.finish().unwrap();
        urls.push(vault.stream_url(&path).unwrap().to_string());
        bodies.push(body);
    }

    let workers: Vec<_> = urls
        .into_iter()
        .zip(bodies)
        .map(|(url, body)| {
            std::thread::spawn(move || {
                let client = client();
                for _ in 0..4 {
                    let received = client.get(&url).send().unwrap().bytes().unwrap();
                    assert_eq!(received.as_ref(), body.as_slice());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    vault.server().unwrap().stop();
}

/// Writing through the sink and reading back through the sequential reader
/// recovers the payload exactly.
#[test]
fn seal_and_read_back_round_trip() {
    init_logging();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("round.mp4");
    let vault = Strombox::new(MasterKey::random());
    let body = payload(123_456);

    let mut writer = vault.open_writer(&path).unwrap();
    writer.write_all(&body).unwrap();
    writer.finish().unwrap();

    // The ciphertext on disk differs from the plaintext everywhere it could.
    let sealed = std::fs::read(&path).unwrap();
    assert!(sealed.len() > body.len());
    assert_ne!(&sealed[sealed.len() - 64..], &body[body.len() - 64..]);

    let mut recovered = Vec::new();
    std::io::Read::read_to_end(&mut vault.open_reader(&path).unwrap(), &mut recovered).unwrap();
    assert_eq!(recovered, body);
}
