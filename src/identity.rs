//! 服务实例 ID 方案
//!
//! ID 形如 `grpc-discover-<服务名>-<uuid>`。固定前缀加服务名构成名称前缀，
//! 按名称发现时用它做前缀扫描；按 ID 发现时用 [`name_of`] 反解出服务名。
//! 后缀是 simple 形式的 UUIDv4（纯十六进制），不含分隔符。

use uuid::Uuid;

use crate::error::{DiscoverError, Result};

/// 所有服务 ID 的固定前缀
pub const SERVICE_ID_PREFIX: &str = "grpc-discover";

/// 字段分隔符，不允许出现在服务名中
pub const SEPARATOR: char = '-';

/// 校验服务名能被无损编码进服务 ID
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DiscoverError::invalid_service_name(name, "name is empty"));
    }
    if name.contains(SEPARATOR) {
        return Err(DiscoverError::invalid_service_name(
            name,
            format!("name must not contain {SEPARATOR:?}"),
        ));
    }
    Ok(())
}

/// 为服务名生成全局唯一的实例 ID
pub fn new_service_id(name: &str) -> String {
    format!("{}{}", name_prefix_of(name), Uuid::new_v4().simple())
}

/// 名称前缀，是该名称所有 ID 的严格前缀，且不是任何其他名称 ID 的前缀
pub fn name_prefix_of(name: &str) -> String {
    format!("{SERVICE_ID_PREFIX}{SEPARATOR}{name}{SEPARATOR}")
}

/// 从服务 ID 中取出服务名
///
/// 去掉固定前缀和最后一个分隔符之后的后缀。ID 不是本模块生成的格式时返回 `None`。
pub fn name_of(id: &str) -> Option<&str> {
    let rest = id
        .strip_prefix(SERVICE_ID_PREFIX)?
        .strip_prefix(SEPARATOR)?;
    let (name, suffix) = rest.rsplit_once(SEPARATOR)?;
    if name.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(name)
}
