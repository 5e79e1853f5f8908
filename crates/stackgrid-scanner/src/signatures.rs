//! Built-in service signatures.
//!
//! A signature is a weighted set of signals for one service type. The
//! scanner scores a folder against every signature; the weights below are
//! tuning knobs, only their relative size matters.

use regex::Regex;
use stackgrid_core::ServiceType;

use crate::error::{ScanError, ScanResult};

/// What a signal looks for inside one folder.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Any of these file names directly in the folder.
    File(Vec<String>),
    /// A file with any of these extensions in the folder or up to two levels below.
    Extension(Vec<String>),
    /// A sub-directory with this name.
    Directory(String),
    /// The pattern matches the excerpt of any of these files in the folder.
    Content { files: Vec<String>, pattern: Regex },
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub weight: f64,
    pub matcher: Matcher,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub service_type: ServiceType,
    pub signals: Vec<Signal>,
}

impl Signature {
    pub fn total_weight(&self) -> f64 {
        self.signals.iter().map(|s| s.weight).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SignatureRegistry {
    signatures: Vec<Signature>,
}

/// Builder helper keeping the signature table below readable.
struct Sig {
    service_type: ServiceType,
    signals: Vec<Signal>,
    error: Option<regex::Error>,
}

impl Sig {
    fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            signals: Vec::new(),
            error: None,
        }
    }

    fn push(mut self, name: &str, weight: f64, matcher: Matcher) -> Self {
        self.signals.push(Signal {
            name: name.to_string(),
            weight,
            matcher,
        });
        self
    }

    fn file(self, name: &str, weight: f64, files: &[&str]) -> Self {
        let files = files.iter().map(|f| f.to_string()).collect();
        self.push(name, weight, Matcher::File(files))
    }

    fn ext(self, name: &str, weight: f64, exts: &[&str]) -> Self {
        let exts = exts.iter().map(|e| e.to_string()).collect();
        self.push(name, weight, Matcher::Extension(exts))
    }

    fn dir(self, name: &str, weight: f64, dir: &str) -> Self {
        self.push(name, weight, Matcher::Directory(dir.to_string()))
    }

    fn content(mut self, name: &str, weight: f64, files: &[&str], pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(pattern) => {
                let files = files.iter().map(|f| f.to_string()).collect();
                self.push(name, weight, Matcher::Content { files, pattern })
            }
            Err(e) => {
                self.error.get_or_insert(e);
                self
            }
        }
    }

    fn finish(self) -> ScanResult<Signature> {
        if let Some(source) = self.error {
            return Err(ScanError::InvalidSignature {
                service_type: self.service_type,
                source,
            });
        }
        Ok(Signature {
            service_type: self.service_type,
            signals: self.signals,
        })
    }
}

const IMAGE_FILES: &[&str] = &["Dockerfile", "docker-compose.yml", "docker-compose.yaml"];

impl SignatureRegistry {
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }

    /// The built-in signature table.
    pub fn builtin() -> ScanResult<Self> {
        use ServiceType as T;

        let signatures = vec![
            Sig::new(T::Node)
                .file("package.json", 3.0, &["package.json"])
                .file("lockfile", 1.0, &["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "bun.lockb"])
                .ext("js/ts sources", 1.0, &["js", "mjs", "cjs", "ts", "tsx", "jsx"])
                .content("start script", 1.0, &["package.json"], r#""(start|serve|dev)"\s*:"#)
                .finish()?,
            Sig::new(T::Python)
                .file("python manifest", 3.0, &["requirements.txt", "pyproject.toml", "setup.py", "Pipfile"])
                .ext("python sources", 1.5, &["py"])
                .content(
                    "web framework",
                    1.0,
                    &["requirements.txt", "pyproject.toml", "Pipfile"],
                    r"(?i)\b(flask|django|fastapi|uvicorn|gunicorn|starlette)\b",
                )
                .finish()?,
            Sig::new(T::Go)
                .file("go.mod", 3.0, &["go.mod"])
                .ext("go sources", 1.5, &["go"])
                .file("go.sum", 0.5, &["go.sum"])
                .content("http module", 1.0, &["go.mod"], r"(gin-gonic|labstack/echo|gorilla/mux|go-chi|gofiber)")
                .finish()?,
            Sig::new(T::Rust)
                .file("Cargo.toml", 3.0, &["Cargo.toml"])
                .ext("rust sources", 1.5, &["rs"])
                .file("Cargo.lock", 0.5, &["Cargo.lock"])
                .content("web crate", 1.0, &["Cargo.toml"], r"(?m)^\s*(axum|actix-web|rocket|warp|hyper|poem)\s*=")
                .finish()?,
            Sig::new(T::Java)
                .file("build manifest", 3.0, &["pom.xml", "build.gradle", "build.gradle.kts"])
                .ext("jvm sources", 1.5, &["java", "kt"])
                .content(
                    "spring",
                    1.0,
                    &["pom.xml", "build.gradle", "build.gradle.kts"],
                    r"(spring-boot|io\.micronaut|io\.quarkus)",
                )
                .finish()?,
            Sig::new(T::Ruby)
                .file("Gemfile", 3.0, &["Gemfile"])
                .ext("ruby sources", 1.5, &["rb"])
                .file("config.ru", 1.0, &["config.ru"])
                .file("Gemfile.lock", 0.5, &["Gemfile.lock"])
                .finish()?,
            Sig::new(T::Php)
                .file("composer.json", 3.0, &["composer.json"])
                .ext("php sources", 1.5, &["php"])
                .file("index.php", 1.0, &["index.php"])
                .finish()?,
            Sig::new(T::StaticSite)
                .file("index.html", 2.0, &["index.html"])
                .ext("web assets", 1.0, &["html", "css"])
                .content("html document", 0.5, &["index.html"], r"(?i)<html")
                .finish()?,
            Sig::new(T::Container)
                .file("Dockerfile", 1.0, &["Dockerfile"])
                .content("exposed port", 0.5, &["Dockerfile"], r"(?im)^\s*EXPOSE\s+\d+")
                .file(".dockerignore", 0.5, &[".dockerignore"])
                .finish()?,
            Sig::new(T::Postgres)
                .content("postgres image", 3.0, IMAGE_FILES, r"(?im)^\s*(FROM|image:)\s*(\S+/)?postgres")
                .file("postgres config", 1.0, &["postgresql.conf", "pg_hba.conf"])
                .ext("sql scripts", 0.5, &["sql"])
                .finish()?,
            Sig::new(T::Mysql)
                .content("mysql image", 3.0, IMAGE_FILES, r"(?im)^\s*(FROM|image:)\s*(\S+/)?(mysql|mariadb)")
                .file("mysql config", 1.0, &["my.cnf"])
                .ext("sql scripts", 0.5, &["sql"])
                .finish()?,
            Sig::new(T::Redis)
                .content("redis image", 3.0, IMAGE_FILES, r"(?im)^\s*(FROM|image:)\s*(\S+/)?(redis|valkey)")
                .file("redis config", 1.0, &["redis.conf"])
                .finish()?,
            Sig::new(T::Mongodb)
                .content("mongo image", 3.0, IMAGE_FILES, r"(?im)^\s*(FROM|image:)\s*(\S+/)?mongo")
                .file("mongo config", 1.0, &["mongod.conf"])
                .dir("seed data", 0.5, "seed")
                .finish()?,
            Sig::new(T::Nginx)
                .file("nginx.conf", 3.0, &["nginx.conf"])
                .content("nginx image", 2.0, &["Dockerfile"], r"(?im)^\s*FROM\s+(\S+/)?nginx")
                .dir("conf.d", 1.0, "conf.d")
                .finish()?,
        ];

        Ok(Self { signatures })
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn get(&self, service_type: ServiceType) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.service_type == service_type)
    }

    /// Replace the weight of one named signal, for tuning.
    pub fn set_weight(&mut self, service_type: ServiceType, signal: &str, weight: f64) -> bool {
        let Some(sig) = self.signatures.iter_mut().find(|s| s.service_type == service_type) else {
            return false;
        };
        match sig.signals.iter_mut().find(|s| s.name == signal) {
            Some(s) => {
                s.weight = weight.max(0.0);
                true
            }
            None => false,
        }
    }
}
