//! Streaming `multipart/form-data` encoder.
//!
//! The body is produced by a background task that opens every attached file,
//! copies it into a bounded channel and then appends the text fields. The
//! transport reads the other end of the channel as the request body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use rand::RngExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::body::{BoxBodyError, WireBody};

const CHANNEL_CAPACITY: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartForm {
    boundary: String,
    files: Vec<(String, PathBuf)>,
    fields: Vec<(String, String)>,
}

impl MultipartForm {
    pub(crate) fn new(
        boundary: String,
        files: Vec<(String, PathBuf)>,
        fields: Vec<(String, String)>,
    ) -> Self {
        Self {
            boundary,
            files,
            fields,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn files(&self) -> &[(String, PathBuf)] {
        &self.files
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

/// Failure of the multipart producer while opening or copying a file.
#[derive(Debug, Error)]
#[error("multipart file {path} for field {field}: {source}")]
pub(crate) struct MultipartSourceError {
    pub(crate) field: String,
    pub(crate) path: String,
    #[source]
    pub(crate) source: std::io::Error,
}

pub(crate) fn random_boundary() -> String {
    let mut rng = rand::rng();
    format!(
        "{:016x}{:016x}",
        rng.random::<u64>(),
        rng.random::<u64>()
    )
}

fn escape_quotes(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn file_part_head(boundary: &str, field: &str, path: &Path) -> Bytes {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Bytes::from(format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        escape_quotes(field),
        escape_quotes(&filename),
    ))
}

fn field_part(boundary: &str, name: &str, value: &str) -> Bytes {
    Bytes::from(format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{value}\r\n",
        escape_quotes(name),
    ))
}

type Chunk = Result<Bytes, BoxBodyError>;

async fn produce(form: Arc<MultipartForm>, sender: mpsc::Sender<Chunk>) {
    for (field, path) in &form.files {
        if sender
            .send(Ok(file_part_head(&form.boundary, field, path)))
            .await
            .is_err()
        {
            return;
        }
        let fail = |source: std::io::Error| -> BoxBodyError {
            warn!(field = %field, path = %path.display(), error = %source, "multipart file copy failed");
            Box::new(MultipartSourceError {
                field: field.clone(),
                path: path.display().to_string(),
                source,
            })
        };
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(source) => {
                let _ = sender.send(Err(fail(source))).await;
                return;
            }
        };
        let mut chunks = ReaderStream::new(file);
        while let Some(chunk) = chunks.next().await {
            let item = chunk.map_err(fail);
            let failed = item.is_err();
            if sender.send(item).await.is_err() || failed {
                return;
            }
        }
        if sender.send(Ok(Bytes::from_static(b"\r\n"))).await.is_err() {
            return;
        }
    }
    for (name, value) in &form.fields {
        if sender
            .send(Ok(field_part(&form.boundary, name, value)))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = sender
        .send(Ok(Bytes::from(format!("--{}--\r\n", form.boundary))))
        .await;
}

/// Spawns the producer task and returns the consuming end as a body.
pub(crate) fn multipart_req_body(form: Arc<MultipartForm>) -> WireBody {
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(produce(form, sender));
    let frames = stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|chunk| (chunk, receiver))
    })
    .map(|chunk: Chunk| chunk.map(Frame::data));
    BodyExt::boxed_unsync(StreamBody::new(frames))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    use http_body_util::BodyExt;

    use super::{MultipartForm, MultipartSourceError, multipart_req_body};

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "reqflow-multipart-{}-{name}",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file");
        path
    }

    #[tokio::test]
    async fn encodes_files_before_fields() {
        let path = temp_file("upload.txt", b"file-bytes");
        let form = MultipartForm::new(
            "b0undary".to_owned(),
            vec![("doc".to_owned(), path.clone())],
            vec![("note".to_owned(), "hi \"there\"".to_owned())],
        );
        let body = multipart_req_body(Arc::new(form))
            .collect()
            .await
            .expect("multipart body should stream")
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).expect("utf-8 body");
        let file_name = path
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .into_owned();
        let expected = format!(
            "--b0undary\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\nfile-bytes\r\n--b0undary\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi \"there\"\r\n--b0undary--\r\n"
        );
        assert_eq!(text, expected);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_file_is_reported_as_stream_error() {
        let form = MultipartForm::new(
            "x".to_owned(),
            vec![("doc".to_owned(), PathBuf::from("/definitely/missing/file.bin"))],
            Vec::new(),
        );
        let error = multipart_req_body(Arc::new(form))
            .collect()
            .await
            .expect_err("missing file should fail the stream");
        let source = error
            .downcast_ref::<MultipartSourceError>()
            .expect("error should carry the multipart source");
        assert_eq!(source.field, "doc");
        assert_eq!(source.source.kind(), std::io::ErrorKind::NotFound);
    }
}
