//! 目标文件管理
//!
//! 预分配目标文件并提供可被多个工作线程共享的定位写入句柄。
//! 数据直接写入目标路径，未完成的区间状态保存在旁路的 `.ranges.json` 文件中。

use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::ranges::{Ranges, RangesSaveData};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 断点续传数据文件后缀
const RESUME_SUFFIX: &str = ".ranges.json";

/// 文件管理器
#[derive(Debug, Clone)]
pub struct FileManager {
    path: PathBuf,
}

impl FileManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 创建父目录并将目标文件调整为 `total_bytes`
    ///
    /// 已存在的文件不会被清空，续传时已下载的字节保持不变
    pub async fn initialize_file(&self, total_bytes: u64) -> DownloadResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::file_system("创建目录失败", parent, e))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| DownloadError::file_system("创建文件失败", &self.path, e))?;

        file.set_len(total_bytes)
            .await
            .map_err(|e| DownloadError::file_system("预分配文件空间失败", &self.path, e))?;

        debug!("文件已预分配: {:?}, 大小: {} bytes", self.path, total_bytes);
        Ok(())
    }

    /// 以读写方式打开目标文件，供多个工作线程按偏移写入
    pub async fn open_file_for_writing(&self) -> DownloadResult<WritableFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| DownloadError::file_system("打开输出文件失败", &self.path, e))?;

        Ok(WritableFile {
            path: self.path.clone(),
            file: Mutex::new(file),
        })
    }

    pub fn resume_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(RESUME_SUFFIX);
        PathBuf::from(name)
    }

    /// 保存区间状态
    pub async fn save_resume_data(&self, data: &RangesSaveData) -> DownloadResult<()> {
        let resume_path = self.resume_path();
        let json = serde_json::to_vec_pretty(data)
            .map_err(|e| DownloadError::validation(format!("序列化续传数据失败: {}", e)))?;
        fs::write(&resume_path, json)
            .await
            .map_err(|e| DownloadError::file_system("写入续传数据失败", &resume_path, e))?;
        debug!("续传数据已保存: {:?}", resume_path);
        Ok(())
    }

    /// 读取区间状态，文件不存在或内容损坏时返回 None
    pub async fn load_resume_data(&self) -> Option<Ranges> {
        let resume_path = self.resume_path();
        let content = fs::read(&resume_path).await.ok()?;

        let data: RangesSaveData = match serde_json::from_slice(&content) {
            Ok(data) => data,
            Err(e) => {
                warn!("续传数据解析失败，忽略: {:?}, 错误: {}", resume_path, e);
                return None;
            }
        };

        match Ranges::from_save_data(data) {
            Ok(ranges) => {
                info!("从续传数据恢复区间状态: {:?}", resume_path);
                Some(ranges)
            }
            Err(e) => {
                warn!("续传数据无效，忽略: {:?}, 错误: {}", resume_path, e);
                None
            }
        }
    }

    pub async fn clear_resume_data(&self) {
        let resume_path = self.resume_path();
        match fs::remove_file(&resume_path).await {
            Ok(()) => debug!("续传数据已删除: {:?}", resume_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除续传数据失败: {:?}, 错误: {}", resume_path, e),
        }
    }
}

/// 共享的可写文件句柄
///
/// 各工作线程写入互不重叠的区间，定位与写入在同一把锁内完成
#[derive(Debug)]
pub struct WritableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl WritableFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> DownloadResult<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::file_system("文件定位失败", &self.path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| DownloadError::file_system("写入文件失败", &self.path, e))?;
        Ok(())
    }

    pub async fn flush(&self) -> DownloadResult<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| DownloadError::file_system("刷新文件失败", &self.path, e))
    }

    pub async fn sync_all(&self) -> DownloadResult<()> {
        let file = self.file.lock().await;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::file_system("同步文件失败", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::ranges::FragmentStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_creates_parent_and_sets_len() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/file.bin");
        let manager = FileManager::new(&path);

        manager.initialize_file(4096).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_initialize_keeps_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"hello").unwrap();

        let manager = FileManager::new(&path);
        manager.initialize_file(10).await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 10);
        assert_eq!(&content[..5], b"hello");
    }

    #[tokio::test]
    async fn test_positioned_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        let manager = FileManager::new(&path);
        manager.initialize_file(8).await.unwrap();

        let file = manager.open_file_for_writing().await.unwrap();
        file.write_at(4, b"5678").await.unwrap();
        file.write_at(0, b"1234").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let manager = FileManager::new(dir.path().join("missing.bin"));
        let err = manager.open_file_for_writing().await.unwrap_err();
        assert!(matches!(err, DownloadError::FileSystem { .. }));
    }

    #[tokio::test]
    async fn test_resume_data_lifecycle() {
        let dir = TempDir::new().unwrap();
        let manager = FileManager::new(dir.path().join("movie.mkv"));
        assert!(manager.load_resume_data().await.is_none());

        let mut ranges = Ranges::new(Some(100));
        ranges.mark_as(0, 49, FragmentStatus::Finished).unwrap();
        manager.save_resume_data(&ranges.to_save_data()).await.unwrap();
        assert!(manager.resume_path().ends_with("movie.mkv.ranges.json"));

        let restored = manager.load_resume_data().await.unwrap();
        assert_eq!(restored, ranges);

        manager.clear_resume_data().await;
        assert!(manager.load_resume_data().await.is_none());
    }
}
