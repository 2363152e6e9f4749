//! 多源并发解析：每个源一个线程做查找，版本号严格更大者胜出。

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, info};

use crate::sources::{Source, SourceFailure, Version};

pub struct Resolver {
    sources: Vec<Arc<dyn Source>>,
}

impl Resolver {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    /// 在所有源中并发查找 `package`。
    ///
    /// - NotFound 是预期情况，既不进错误列表也不影响其他源；
    /// - 其他失败记为 [`SourceFailure`]，该源退出本轮竞争；
    /// - 命中里版本号严格更大者胜出；版本号相同时保留先写入者——
    ///   完成顺序相关，属于已记录的非确定性，不要在测试里依赖它；
    /// - 所有查找线程 join 之后才返回，不留后台工作；
    /// - 全部未找到时返回零值 Version 和 None，错误列表为空。
    pub fn resolve(
        &self,
        package: &str,
        version_code: u64,
    ) -> (Version, Option<Arc<dyn Source>>, Vec<SourceFailure>) {
        info!("在 {} 个源中搜索 {}", self.sources.len(), package);

        let winner: Mutex<(Version, Option<Arc<dyn Source>>)> =
            Mutex::new((Version::default(), None));
        let failures: Mutex<Vec<SourceFailure>> = Mutex::new(Vec::new());

        thread::scope(|scope| {
            let winner = &winner;
            let failures = &failures;
            for source in &self.sources {
                scope.spawn(move || match source.find_by_package(package, version_code) {
                    Ok(version) => {
                        info!(
                            "在源 {} 找到 {} v{}（{}）",
                            source.name(),
                            package,
                            version.name,
                            version.code
                        );
                        let mut best = winner.lock().unwrap_or_else(|e| e.into_inner());
                        if version.code > best.0.code {
                            *best = (version, Some(source.clone()));
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        debug!("{} 在源 {} 未找到", package, source.name());
                    }
                    Err(err) => {
                        error!("在源 {} 查找 {} 出错: {}", source.name(), package, err);
                        failures
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(SourceFailure {
                                source: source.name().to_string(),
                                package: package.to_string(),
                                error: err,
                            });
                    }
                });
            }
        });

        let (version, source) = winner.into_inner().unwrap_or_else(|e| e.into_inner());
        let failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
        (version, source, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FileType, SourceError};
    use std::io::Read;

    enum StubOutcome {
        Found(u64),
        NotFound,
        Fail,
    }

    struct StubSource {
        name: &'static str,
        outcome: StubOutcome,
    }

    impl StubSource {
        fn found(name: &'static str, code: u64) -> Arc<dyn Source> {
            Arc::new(Self {
                name,
                outcome: StubOutcome::Found(code),
            })
        }

        fn not_found(name: &'static str) -> Arc<dyn Source> {
            Arc::new(Self {
                name,
                outcome: StubOutcome::NotFound,
            })
        }

        fn failing(name: &'static str) -> Arc<dyn Source> {
            Arc::new(Self {
                name,
                outcome: StubOutcome::Fail,
            })
        }
    }

    impl Source for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn find_by_package(&self, package: &str, version_code: u64) -> Result<Version, SourceError> {
            match self.outcome {
                StubOutcome::Found(code) => {
                    if version_code != 0 && version_code != code {
                        return Err(SourceError::NotFound {
                            package: package.to_string(),
                        });
                    }
                    Ok(Version {
                        name: format!("{code}.0"),
                        code,
                        size: 64,
                        link: format!("/{package}.apk"),
                        package_name: package.to_string(),
                        developer_id: "dev".to_string(),
                        file_type: Some(FileType::Apk),
                    })
                }
                StubOutcome::NotFound => Err(SourceError::NotFound {
                    package: package.to_string(),
                }),
                StubOutcome::Fail => Err(SourceError::Shape("boom".to_string())),
            }
        }

        fn download(&self, _version: &Version) -> Result<Box<dyn Read + Send>, SourceError> {
            Ok(Box::new(std::io::empty()))
        }
    }

    #[test]
    fn single_hit_wins_with_no_errors() {
        let resolver = Resolver::new(vec![
            StubSource::not_found("a"),
            StubSource::found("b", 7),
            StubSource::not_found("c"),
        ]);
        let (version, source, failures) = resolver.resolve("pkg", 0);
        assert_eq!(version.code, 7);
        assert_eq!(source.unwrap().name(), "b");
        assert!(failures.is_empty());
    }

    #[test]
    fn all_not_found_is_clean_zero() {
        let resolver = Resolver::new(vec![StubSource::not_found("a"), StubSource::not_found("b")]);
        let (version, source, failures) = resolver.resolve("pkg", 0);
        assert!(!version.is_found());
        assert!(source.is_none());
        assert!(failures.is_empty());
    }

    #[test]
    fn highest_code_wins_regardless_of_order() {
        for _ in 0..16 {
            let resolver = Resolver::new(vec![
                StubSource::found("low", 5),
                StubSource::not_found("none"),
                StubSource::found("high", 7),
            ]);
            let (version, source, failures) = resolver.resolve("pkg", 0);
            assert_eq!(version.code, 7);
            assert_eq!(source.unwrap().name(), "high");
            assert!(failures.is_empty());
        }
    }

    #[test]
    fn failures_are_collected_but_do_not_abort() {
        let resolver = Resolver::new(vec![StubSource::failing("bad"), StubSource::found("ok", 3)]);
        let (version, source, failures) = resolver.resolve("pkg", 0);
        assert_eq!(version.code, 3);
        assert_eq!(source.unwrap().name(), "ok");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, "bad");
        assert_eq!(failures[0].package, "pkg");
    }

    #[test]
    fn exact_code_resolution_is_deterministic() {
        let resolver = Resolver::new(vec![StubSource::found("a", 5), StubSource::found("b", 7)]);
        let (first, _, _) = resolver.resolve("pkg", 5);
        let (second, _, _) = resolver.resolve("pkg", 5);
        assert_eq!(first, second);
        assert_eq!(first.code, 5);
    }
}
