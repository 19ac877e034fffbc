//! `codexcord status`, `codexcord projects` and `codexcord forget-project`.

use anyhow::Context;

use crate::canonical::canonicalize_project_path;
use crate::lock;
use crate::paths::DataPaths;
use crate::store::MappingStore;
use crate::VERSION;

pub fn status(paths: &DataPaths) -> anyhow::Result<()> {
    println!();
    println!("  codexcord v{}", VERSION);
    println!("  Data dir: {}", paths.root().display());

    let lock_path = paths.lock_path();
    let running = match lock::read_owner(&lock_path) {
        Some(owner) if owner.is_alive() => {
            println!(
                "  Lock: pid {} (running since {}, cwd {})",
                owner.pid, owner.started_at, owner.cwd
            );
            true
        }
        Some(owner) => {
            println!("  Lock: pid {} (stale, process not found)", owner.pid);
            false
        }
        None if lock_path.exists() => {
            println!("  Lock: {} (unreadable)", lock_path.display());
            false
        }
        None => {
            println!("  Lock: not held");
            false
        }
    };

    let db_path = paths.db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);

        let store = MappingStore::open(&db_path).context("open mapping store")?;
        let projects = store.list_projects()?;
        let mut threads = 0usize;
        let mut linked = 0usize;
        for project in &projects {
            let rows = store.list_threads(project.id)?;
            linked += rows.iter().filter(|t| t.session_id.is_some()).count();
            threads += rows.len();
        }
        println!(
            "  Mappings: {} projects, {} threads ({} linked to sessions)",
            projects.len(),
            threads,
            linked
        );
    } else {
        println!("  Database: not found");
    }

    println!();
    if !running {
        println!("  Bridge is not running.");
        println!("  Start with: codexcord start");
        println!();
    }
    Ok(())
}

pub fn projects(paths: &DataPaths) -> anyhow::Result<()> {
    let store = MappingStore::open(&paths.db_path()).context("open mapping store")?;
    let projects = store.list_projects()?;
    if projects.is_empty() {
        println!("No projects mapped yet.");
        return Ok(());
    }

    for project in projects {
        let threads = store.list_threads(project.id)?;
        println!(
            "{:<24} {:>4} threads  channel {}  {}",
            project.name,
            threads.len(),
            project.channel_id,
            project.path
        );
        if let Some(model) = project.model.as_deref() {
            println!("{:<24} model {}", "", model);
        }
    }
    Ok(())
}

/// Operator removal of one project. The Discord channel is left alone; the
/// next session in that directory maps to a fresh channel.
pub fn forget_project(paths: &DataPaths, path: &str) -> anyhow::Result<()> {
    let store = MappingStore::open(&paths.db_path()).context("open mapping store")?;
    let canonical = canonicalize_project_path(path);
    let Some(project) = store.project_by_path(&canonical)? else {
        anyhow::bail!("no project mapped for {canonical}");
    };

    let threads = store.list_threads(project.id)?.len();
    store.delete_project(project.id)?;
    println!(
        "Forgot {} ({} threads, channel {} left in place)",
        project.path, threads, project.channel_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use codexcord_protocol::NewProject;

    use super::*;

    #[test]
    fn forget_project_accepts_any_spelling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project_dir = dir.path().join("api");
        std::fs::create_dir(&project_dir).expect("mkdir");
        let paths = DataPaths::new(dir.path().join("data"));
        paths.ensure_dirs().expect("dirs");

        {
            let store = MappingStore::open(&paths.db_path()).expect("store");
            let project = store
                .create_project(NewProject {
                    channel_id: "c1".to_string(),
                    path: project_dir.to_string_lossy().into_owned(),
                    name: "api".to_string(),
                    model: None,
                    approval_policy: None,
                })
                .expect("project");
            store
                .create_thread("t1", project.id, "first", Some("s1"))
                .expect("thread");
        }

        let spelled = format!("{}/./", project_dir.display());
        forget_project(&paths, &spelled).expect("forget");

        let store = MappingStore::open(&paths.db_path()).expect("store");
        assert!(store.list_projects().expect("list").is_empty());
        assert!(store.thread_by_session("s1").expect("lookup").is_none());
        assert!(forget_project(&paths, &spelled).is_err());
    }
}
