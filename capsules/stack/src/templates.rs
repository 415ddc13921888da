//! Recipe templates compiled into the binary.

const NODE: &str = r#"FROM node:20-alpine
WORKDIR {{WORKDIR}}
COPY package*.json ./
RUN if [ -f package-lock.json ]; then npm ci; else npm install; fi
COPY . .
ENV PORT={{PORT}}
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

const PHP: &str = r#"FROM php:8.2-cli
RUN apt-get update && apt-get install -y --no-install-recommends git unzip \
    && rm -rf /var/lib/apt/lists/*
COPY --from=composer:2 /usr/bin/composer /usr/bin/composer
WORKDIR {{WORKDIR}}
COPY . .
RUN if [ -f composer.json ]; then composer install --no-dev --no-interaction --prefer-dist; fi
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

const PYTHON: &str = r#"FROM python:3.11-slim
WORKDIR {{WORKDIR}}
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi \
    && if [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi
ENV PORT={{PORT}}
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

const FLASK: &str = r#"FROM python:3.11-slim
WORKDIR {{WORKDIR}}
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi \
    && pip install --no-cache-dir gunicorn
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

const ANDROID_GRADLE: &str = r#"FROM gradle:8.5-jdk17
WORKDIR {{WORKDIR}}
COPY . .
RUN if [ -f gradlew ]; then chmod +x gradlew; fi
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

/// Serves the workspace as static files when nothing better is known.
const DEFAULT: &str = r#"FROM python:3.11-alpine
WORKDIR {{WORKDIR}}
COPY . .
EXPOSE {{PORT}}
CMD ["sh", "-c", {{START_CMD}}]
"#;

pub(crate) fn builtin(name: &str) -> Option<&'static str> {
    match name {
        "node" => Some(NODE),
        "php" => Some(PHP),
        "python" => Some(PYTHON),
        "flask" => Some(FLASK),
        "android-gradle" => Some(ANDROID_GRADLE),
        "default" => Some(DEFAULT),
        _ => None,
    }
}
