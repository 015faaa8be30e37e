//! 模型数据校验
//!
//! 结构校验由 serde 反序列化完成，业务规则由 [`Schema::check`] 补充。

use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// 校验失败的具体位置与原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON 路径，例如 `$.items[0]`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// 根路径上的问题
    pub fn root(message: impl Into<String>) -> Self {
        Self::new("$", message)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// 模型 schema
pub trait Schema<T>: Send + Sync + 'static {
    /// 将存储中的原始 JSON 解析为模型数据
    fn parse(&self, raw: &serde_json::Value) -> Result<T, ValidationIssue>
    where
        T: DeserializeOwned,
    {
        let value: T = serde_json::from_value(raw.clone()).map_err(|e| ValidationIssue::root(e.to_string()))?;
        self.check(&value)?;
        Ok(value)
    }

    /// 业务规则校验，默认全部通过
    fn check(&self, _value: &T) -> Result<(), ValidationIssue> {
        Ok(())
    }
}

/// 仅做 serde 结构校验的 schema
pub struct SerdeSchema<T>(PhantomData<fn() -> T>);

impl<T> SerdeSchema<T> {
    pub fn new() -> Self {
        SerdeSchema(PhantomData)
    }
}

impl<T> Default for SerdeSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Schema<T> for SerdeSchema<T> {}

/// 以闭包提供业务规则的 schema
pub struct FnSchema<T, F> {
    check: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnSchema<T, F>
where
    F: Fn(&T) -> Result<(), ValidationIssue> + Send + Sync + 'static,
{
    pub fn new(check: F) -> Self {
        Self {
            check,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Schema<T> for FnSchema<T, F>
where
    T: 'static,
    F: Fn(&T) -> Result<(), ValidationIssue> + Send + Sync + 'static,
{
    fn check(&self, value: &T) -> Result<(), ValidationIssue> {
        (self.check)(value)
    }
}
