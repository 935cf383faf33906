//! Container round-trip tests over both backends.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde_json::json;
use tokio::net::TcpListener;

use scan_storage::{AttrMap, Container, OpenMode, StorageServer};

fn sample_array() -> ArrayD<f64> {
    ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
}

fn sample_attrs() -> AttrMap {
    BTreeMap::from([
        ("data_type".to_string(), json!("2D")),
        ("Naverage".to_string(), json!(1)),
        ("shape".to_string(), json!([2, 3])),
        ("TITLE".to_string(), json!("sample")),
    ])
}

/// Write a small tree through one container handle and read it back
/// through another; shape, values and attribute set must survive.
async fn assert_round_trip(write_url: &str, read_url: &str) {
    {
        let mut c = Container::open(write_url, OpenMode::Write).await.unwrap();
        let root = c.root();
        let group = c.get_or_create_group(root, "RawData", "raw").await.unwrap();
        let array = c
            .create_array(group, "Data", sample_array(), sample_attrs())
            .await
            .unwrap();
        c.set_attr(array, "scan_type", json!("Scan1D/Linear"))
            .await
            .unwrap();
        c.write_at(
            array,
            &[1],
            ArrayD::from_shape_vec(IxDyn(&[3]), vec![7.0, 8.0, 9.0]).unwrap(),
        )
        .await
        .unwrap();
        c.flush().await.unwrap();
    }

    let mut c = Container::open(read_url, OpenMode::Read).await.unwrap();
    let root = c.root();
    let group = c.find_child(root, "RawData").await.unwrap().unwrap();
    let array = c.find_child(group, "Data").await.unwrap().unwrap();

    let data = c.read(array).await.unwrap();
    assert_eq!(data.shape(), &[2, 3]);
    assert_eq!(data[IxDyn(&[0, 0])], 1.0);
    assert_eq!(data[IxDyn(&[1, 2])], 9.0);

    let mut keys = c.attr_keys(array).await.unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec!["Naverage", "TITLE", "data_type", "scan_type", "shape"]
    );
    assert_eq!(c.get_attr(array, "data_type").await.unwrap().unwrap(), json!("2D"));
    assert_eq!(
        c.get_attr(array, "scan_type").await.unwrap().unwrap(),
        json!("Scan1D/Linear")
    );
    assert_eq!(c.get_attr(array, "shape").await.unwrap().unwrap(), json!([2, 3]));
}

#[tokio::test]
async fn file_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("trip.scan").display().to_string();
    assert_round_trip(&url, &url).await;
}

#[tokio::test]
async fn remote_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StorageServer::new(dir.path());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let url = format!("scan://{}/trip", addr);
    assert_round_trip(&url, &url).await;
}

#[tokio::test]
async fn remote_writes_land_in_the_served_file() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StorageServer::new(dir.path());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    {
        let mut c = Container::open(&format!("scan://{}/exp", addr), OpenMode::Write)
            .await
            .unwrap();
        let root = c.root();
        let group = c.get_or_create_group(root, "RawData", "raw").await.unwrap();
        c.create_array(group, "Data", sample_array(), AttrMap::new())
            .await
            .unwrap();
        c.flush().await.unwrap();
    }

    // The same tree is readable directly from the server's data dir.
    let path = dir.path().join("exp.scan").display().to_string();
    let mut c = Container::open(&path, OpenMode::Read).await.unwrap();
    let root = c.root();
    let group = c.find_child(root, "RawData").await.unwrap().unwrap();
    let array = c.find_child(group, "Data").await.unwrap().unwrap();
    assert_eq!(c.read(array).await.unwrap(), sample_array());
}

#[tokio::test]
async fn append_mode_extends_an_existing_container() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("appended.scan").display().to_string();
    {
        let mut c = Container::open(&url, OpenMode::Write).await.unwrap();
        let root = c.root();
        c.get_or_create_group(root, "RawData", "raw").await.unwrap();
        c.flush().await.unwrap();
    }
    {
        let mut c = Container::open(&url, OpenMode::Append).await.unwrap();
        let root = c.root();
        // Idempotent re-open of the in-progress hierarchy.
        let group = c.get_or_create_group(root, "RawData", "raw").await.unwrap();
        c.create_array(group, "extra", sample_array(), AttrMap::new())
            .await
            .unwrap();
        c.flush().await.unwrap();
    }
    let mut c = Container::open(&url, OpenMode::Read).await.unwrap();
    let root = c.root();
    let group = c.find_child(root, "RawData").await.unwrap().unwrap();
    assert!(c.find_child(group, "extra").await.unwrap().is_some());
}

#[tokio::test]
async fn invalid_urls_are_rejected() {
    assert!(Container::open("", OpenMode::Write).await.is_err());
    assert!(Container::open("scan://nohost", OpenMode::Write).await.is_err());
}
