use anyhow::Context;
use customer_screen_lib::storage::{delete_credential, set_credential, KEY_BRANCH_KEY};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("set-key") => {
            let key = args
                .next()
                .filter(|k| !k.trim().is_empty())
                .context("usage: customer-screen set-key <branch-key>")?;
            set_credential(KEY_BRANCH_KEY, key.trim())
                .map_err(anyhow::Error::msg)
                .context("Failed to store branch key")?;
            println!("Branch key stored");
            Ok(())
        }
        Some("clear-key") => {
            delete_credential(KEY_BRANCH_KEY)
                .map_err(anyhow::Error::msg)
                .context("Failed to delete branch key")?;
            println!("Branch key cleared");
            Ok(())
        }
        display_url => customer_screen_lib::run(display_url.map(str::to_string)),
    }
}
