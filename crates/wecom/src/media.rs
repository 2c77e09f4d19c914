//! Download, decrypt and cache inbound attachments.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {reqwest::header::CONTENT_DISPOSITION, tracing::info};

use crate::{
    codec::MediaDecryptor,
    error::{Context, Error, Result},
};

/// A decrypted attachment on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMedia {
    pub path: PathBuf,
    pub mime_type: String,
    /// Display name for files; `None` for images.
    pub file_name: Option<String>,
}

pub struct MediaFetcher {
    http: reqwest::Client,
    decryptor: Arc<dyn MediaDecryptor>,
    cache_dir: PathBuf,
}

impl MediaFetcher {
    pub fn new(
        http: reqwest::Client,
        decryptor: Arc<dyn MediaDecryptor>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            decryptor,
            cache_dir: cache_dir.into(),
        }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let fetch_err = |source| Error::Fetch {
            url: url.to_string(),
            source,
        };
        let resp = self.http.get(url).send().await.map_err(fetch_err)?;
        if !resp.status().is_success() {
            return Err(Error::FetchStatus {
                url: url.to_string(),
                status: resp.status(),
            });
        }
        let disposition = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(fetch_err)?;
        Ok((bytes.to_vec(), disposition))
    }

    async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("failed to create media dir {}", self.cache_dir.display()))?;
        let path = self.cache_dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Fetch an encrypted image. The extension comes from the decrypted bytes.
    pub async fn fetch_image(&self, url: &str) -> Result<SavedMedia> {
        info!(url = %crate::preview(url), "downloading encrypted image");
        let (encrypted, _) = self.download(url).await?;
        let decrypted = self.decryptor.decrypt_media(&encrypted)?;

        let ext = sniff_image_ext(&decrypted);
        let path = self
            .write(&format!("wecom_{}.{ext}", unique_suffix()), &decrypted)
            .await?;
        let mime_type = guess_mime_type(&format!("image.{ext}")).to_string();
        info!(path = %path.display(), size = decrypted.len(), mime_type = %mime_type, "image decrypted and saved");
        Ok(SavedMedia {
            path,
            mime_type,
            file_name: None,
        })
    }

    /// Fetch an encrypted file. The name comes from the message, else the
    /// `Content-Disposition` header, else a timestamp.
    pub async fn fetch_file(&self, url: &str, file_name: Option<&str>) -> Result<SavedMedia> {
        info!(url = %crate::preview(url), name = ?file_name, "downloading encrypted file");
        let (encrypted, disposition) = self.download(url).await?;
        let effective_name = file_name
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .or_else(|| disposition.as_deref().and_then(content_disposition_file_name));
        let decrypted = self.decryptor.decrypt_media(&encrypted)?;

        let safe_name = sanitize_file_name(
            effective_name
                .as_deref()
                .unwrap_or(&format!("file_{}", unix_millis())),
        );
        let path = self
            .write(&format!("{}_{safe_name}", unix_millis()), &decrypted)
            .await?;
        info!(path = %path.display(), size = decrypted.len(), "file decrypted and saved");
        Ok(SavedMedia {
            mime_type: guess_mime_type(effective_name.as_deref().unwrap_or_default()).to_string(),
            path,
            file_name: effective_name,
        })
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn unique_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", unix_millis(), &id[..6])
}

/// `png` / `gif` by magic bytes, `jpg` otherwise.
#[must_use]
pub fn sniff_image_ext(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, 0x50, ..] => "png",
        [0x47, 0x49, ..] => "gif",
        _ => "jpg",
    }
}

#[must_use]
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// File name from a `Content-Disposition` value, handling both
/// `filename="a.pdf"` and `filename*=UTF-8''a.pdf`.
#[must_use]
pub fn content_disposition_file_name(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("filename")?;
    let rest = &header[start + "filename".len()..];
    let rest = rest.strip_prefix('*').unwrap_or(rest).trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let rest = match rest.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("utf-8''") => &rest[7..],
        _ => rest,
    };
    let rest = rest.trim_start_matches(['"', '\'']);
    let raw = rest
        .split(['"', '\'', ';', '\n'])
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    Some(decoded)
}

/// Replace characters that are unsafe in file names with `_`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {super::*, rstest::rstest};

    /// XORs every byte with 0xAA; input starting with `BAD` fails.
    pub(crate) struct XorDecryptor;

    impl MediaDecryptor for XorDecryptor {
        fn decrypt_media(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
            if encrypted.starts_with(b"BAD") {
                return Err(Error::decrypt("padding check failed"));
            }
            Ok(encrypted.iter().map(|b| b ^ 0xAA).collect())
        }
    }

    pub(crate) fn xor(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().map(|b| b ^ 0xAA).collect()
    }

    fn fetcher(dir: &Path) -> MediaFetcher {
        MediaFetcher::new(reqwest::Client::new(), Arc::new(XorDecryptor), dir)
    }

    #[rstest]
    #[case(&[0x89, 0x50, 0x4e, 0x47], "png")]
    #[case(&[0x47, 0x49, 0x46, 0x38], "gif")]
    #[case(&[0xff, 0xd8, 0xff], "jpg")]
    #[case(&[0x89], "jpg")]
    #[case(&[], "jpg")]
    fn sniffs_image_extension(#[case] bytes: &[u8], #[case] ext: &str) {
        assert_eq!(sniff_image_ext(bytes), ext);
    }

    #[rstest]
    #[case("report.PDF", "application/pdf")]
    #[case("photo.jpeg", "image/jpeg")]
    #[case("a.tar.zip", "application/zip")]
    #[case("README", "application/octet-stream")]
    #[case("", "application/octet-stream")]
    fn guesses_mime_from_extension(#[case] name: &str, #[case] mime: &str) {
        assert_eq!(guess_mime_type(name), mime);
    }

    #[rstest]
    #[case(r#"attachment; filename="report.pdf""#, Some("report.pdf"))]
    #[case("attachment; filename*=UTF-8''%E6%8A%A5%E5%91%8A.docx", Some("报告.docx"))]
    #[case("attachment; FILENAME=plain.txt; size=3", Some("plain.txt"))]
    #[case("inline", None)]
    #[case(r#"attachment; filename="""#, None)]
    fn parses_content_disposition(#[case] header: &str, #[case] expected: Option<&str>) {
        assert_eq!(content_disposition_file_name(header).as_deref(), expected);
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(sanitize_file_name(r#"a/b\c:d*e?f"g<h>i|j.txt"#), "a_b_c_d_e_f_g_h_i_j.txt");
        assert_eq!(sanitize_file_name("季度报告.pdf"), "季度报告.pdf");
    }

    #[tokio::test]
    async fn fetch_image_decrypts_and_sniffs_extension() {
        let dir = tempfile::tempdir().unwrap();
        let png = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a];
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/img")
            .with_status(200)
            .with_body(xor(&png))
            .create_async()
            .await;

        let saved = fetcher(dir.path())
            .fetch_image(&format!("{}/img", server.url()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(saved.mime_type, "image/png");
        assert_eq!(saved.path.extension().unwrap(), "png");
        assert!(saved.path.starts_with(dir.path()));
        assert_eq!(std::fs::read(&saved.path).unwrap(), png);
    }

    #[tokio::test]
    async fn fetch_image_reports_http_failure_as_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/img").with_status(404).create_async().await;

        let err = fetcher(dir.path())
            .fetch_image(&format!("{}/img", server.url()))
            .await
            .unwrap_err();
        assert!(err.is_fetch(), "{err}");
    }

    #[tokio::test]
    async fn fetch_image_reports_decrypt_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/img")
            .with_status(200)
            .with_body("BAD payload")
            .create_async()
            .await;

        let err = fetcher(dir.path())
            .fetch_image(&format!("{}/img", server.url()))
            .await
            .unwrap_err();
        assert!(err.is_decrypt(), "{err}");
    }

    #[tokio::test]
    async fn fetch_file_takes_name_from_header_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file")
            .with_status(200)
            .with_header("content-disposition", r#"attachment; filename="q3:plan.xlsx""#)
            .with_body(xor(b"sheet"))
            .create_async()
            .await;

        let saved = fetcher(dir.path())
            .fetch_file(&format!("{}/file", server.url()), None)
            .await
            .unwrap();

        assert_eq!(saved.file_name.as_deref(), Some("q3:plan.xlsx"));
        assert_eq!(
            saved.mime_type,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        let written = saved.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(written.ends_with("_q3_plan.xlsx"), "{written}");
        assert_eq!(std::fs::read(&saved.path).unwrap(), b"sheet");
    }

    #[tokio::test]
    async fn fetch_file_prefers_message_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file")
            .with_status(200)
            .with_header("content-disposition", r#"attachment; filename="other.bin""#)
            .with_body(xor(b"%PDF"))
            .create_async()
            .await;

        let saved = fetcher(dir.path())
            .fetch_file(&format!("{}/file", server.url()), Some("合同.pdf"))
            .await
            .unwrap();
        assert_eq!(saved.file_name.as_deref(), Some("合同.pdf"));
        assert_eq!(saved.mime_type, "application/pdf");
    }
}
