use imagelift::config::Settings;
use imagelift::jobs::{self, JobStatus, MemoryJobStore};
use imagelift::paths::AppPaths;
use imagelift::sessions::{self, MemoryScanStore};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

const JOB_TIMEOUT_SECS: u64 = 30;

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([30, 60, 90]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Minimal canned-response HTTP server; unknown paths answer 404.
fn spawn_fixture_server(routes: HashMap<String, Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let routes = Arc::new(routes);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                break;
            };
            let routes = routes.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let n = match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();

                let response = match routes.get(&path) {
                    Some(body) => {
                        let mut out = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        out.extend_from_slice(body);
                        out
                    }
                    None => {
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec()
                    }
                };
                let _ = stream.write_all(&response);
            });
        }
    });

    format!("http://{addr}")
}

#[test]
fn scan_enhance_optimize_round_trip() {
    let page_html = r#"
    <html><body>
      <img src="/a.png" alt="first" />
      <picture><source srcset="/b.png 1x" /></picture>
      <div style="background-image: url('/missing.png')"></div>
    </body></html>
    "#;
    let png = png_bytes(6, 4);
    let mut routes = HashMap::new();
    routes.insert("/page".to_string(), page_html.as_bytes().to_vec());
    routes.insert("/a.png".to_string(), png.clone());
    routes.insert("/b.png".to_string(), png.clone());
    // /missing.png intentionally absent.
    let base_url = spawn_fixture_server(routes);
    let page_url = format!("{base_url}/page");

    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let settings = Settings {
        provider: "passthrough".to_string(),
        ..Settings::default()
    };

    let scan_store = Arc::new(MemoryScanStore::new());
    let job_store = Arc::new(MemoryJobStore::new());

    // Scan: three discovered, two downloadable.
    let session =
        sessions::start_scan(&paths, scan_store.as_ref(), &settings, &page_url).expect("scan");
    assert_eq!(session.images.len(), 2);
    assert!(session.images.iter().all(|img| {
        img.local_path.as_ref().map(|p| p.exists()).unwrap_or(false)
            && img.file_size.is_some()
            && (img.width, img.height) == (Some(6), Some(4))
    }));

    let stored = sessions::get_scan(scan_store.as_ref(), &session.id)
        .expect("get scan")
        .expect("session present");
    assert_eq!(stored.images.len(), 2);
    assert!(sessions::get_scan(scan_store.as_ref(), "scan_ffffffffffff")
        .expect("unknown scan lookup")
        .is_none());

    // Enqueue the whole scan and let the background runner drain it.
    let queued = jobs::enqueue_enhance_batch(scan_store.as_ref(), job_store.as_ref(), &session.id, 2)
        .expect("enqueue batch");
    assert_eq!(queued.len(), 2);

    let runner = jobs::start_runner(
        paths.clone(),
        settings,
        scan_store.clone(),
        job_store.clone(),
    )
    .expect("start runner");

    let deadline = Instant::now() + Duration::from_secs(JOB_TIMEOUT_SECS);
    loop {
        let jobs_now = jobs::list_jobs(job_store.as_ref()).expect("list jobs");
        if jobs_now.len() == 2 && jobs_now.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not finish in time");
        std::thread::sleep(Duration::from_millis(100));
    }
    runner.stop();

    for job in jobs::list_jobs(job_store.as_ref()).expect("list jobs") {
        assert_eq!(job.status, JobStatus::Completed, "job error: {:?}", job.error);
        let output_path = job.output_path.expect("output path");
        assert!(output_path.exists());
        assert!(job.size_reduction_percent.is_some());
    }

    // Downstream contracts: enhanced outputs are listed and mapped back to
    // their original URLs for the screenshot collaborator.
    let outputs = imagelift::optimizer::list_enhanced_outputs(&paths).expect("outputs");
    assert_eq!(outputs.len(), 2);

    let replacements =
        sessions::image_replacements(&paths, scan_store.as_ref(), &session.id).expect("map");
    assert_eq!(replacements.len(), 2);
    for image in &stored.images {
        assert!(replacements.contains_key(&image.original_url));
    }

    // Bulk reset leaves empty stores and directories behind.
    let summary =
        sessions::clear_all(&paths, scan_store.as_ref(), job_store.as_ref()).expect("clear");
    assert_eq!(summary.removed_scans, 1);
    assert_eq!(summary.removed_jobs, 2);
    assert!(summary.removed_temp_files >= 2);
    assert!(summary.removed_output_files >= 2);
    assert!(jobs::list_jobs(job_store.as_ref()).expect("list").is_empty());
}
