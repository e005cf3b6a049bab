//! Subcommands and how each one runs against the client.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

use rrsync::api::{image_urls_for_restaurant, url_for_restaurant, Restaurant, ALL};
use rrsync::cache::{CacheResult, CacheSource};
use rrsync::event::{Event, EventHandler};
use rrsync::{Config, Error, RestaurantClient};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// List restaurants
  #[command(alias = "ls")]
  List {
    /// Only this cuisine ("all" for any)
    #[arg(long, default_value = ALL)]
    cuisine: String,
    /// Only this neighborhood ("all" for any)
    #[arg(long, default_value = ALL)]
    neighborhood: String,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Show a restaurant and its reviews
  Show {
    id: i64,
    #[arg(long)]
    json: bool,
  },
  /// List neighborhoods
  Neighborhoods,
  /// List cuisines
  Cuisines,
  /// Mark a restaurant as favorite
  Favorite { id: i64 },
  /// Remove a restaurant from favorites
  Unfavorite { id: i64 },
  /// Add, edit or delete reviews
  #[command(subcommand)]
  Review(ReviewCommand),
  /// Show writes waiting for the backend
  Pending {
    #[arg(long)]
    json: bool,
  },
  /// Replay pending writes now
  Sync,
  /// Fetch the asset precache manifest
  Precache,
  /// Replay pending writes whenever the backend comes back
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum ReviewCommand {
  /// Add a review
  Add {
    restaurant_id: i64,
    #[arg(long)]
    name: String,
    /// 1 to 5
    #[arg(long)]
    rating: u8,
    #[arg(long, default_value = "")]
    comments: String,
  },
  /// Edit a review; omitted fields keep their value
  Update {
    id: i64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    rating: Option<u8>,
    #[arg(long)]
    comments: Option<String>,
  },
  /// Delete a review
  Delete { id: i64 },
}

pub async fn run(command: Command, client: &RestaurantClient, config: &Config) -> Result<()> {
  match command {
    Command::List {
      cuisine,
      neighborhood,
      json,
    } => {
      let result = client
        .fetch_by_cuisine_and_neighborhood(&cuisine, &neighborhood)
        .await?;
      let restaurants = settle(result).await;
      if json {
        print_json(&restaurants)?;
      } else {
        for restaurant in &restaurants {
          print_restaurant(restaurant);
        }
      }
    }
    Command::Show { id, json } => {
      let details = settle(client.fetch_by_id(id).await?).await;
      if json {
        print_json(&details)?;
      } else {
        print_restaurant(&details.restaurant);
        let r = &details.restaurant;
        println!("  {}", r.address);
        println!("  page: {}", url_for_restaurant(r));
        let images = image_urls_for_restaurant(r);
        println!("  images: {} {}", images.x1, images.x2);
        for (day, hours) in &r.operating_hours {
          println!("  {day}: {hours}");
        }
        println!();
        for review in &details.reviews {
          let pending = if review.is_temporary() { " (not synced)" } else { "" };
          println!(
            "  [{}] {} - {}/5{pending}",
            review.id, review.name, review.rating
          );
          if !review.comments.is_empty() {
            println!("      {}", review.comments);
          }
        }
      }
    }
    Command::Neighborhoods => {
      for neighborhood in client.fetch_neighborhoods().await? {
        println!("{neighborhood}");
      }
    }
    Command::Cuisines => {
      for cuisine in client.fetch_cuisines().await? {
        println!("{cuisine}");
      }
    }
    Command::Favorite { id } => report_write(client.favorite(id).await, |r| {
      format!("{} is now a favorite", r.name)
    })?,
    Command::Unfavorite { id } => report_write(client.unfavorite(id).await, |r| {
      format!("{} is no longer a favorite", r.name)
    })?,
    Command::Review(review) => run_review(review, client).await?,
    Command::Pending { json } => {
      let pending = client.pending()?;
      if json {
        let rows: Vec<_> = pending
          .iter()
          .map(|p| {
            serde_json::json!({
              "key": p.key,
              "mutation": p.mutation,
              "record_id": p.record_id,
              "attempts": p.attempts,
              "last_error": p.last_error,
              "created_at": p.created_at,
            })
          })
          .collect();
        print_json(&rows)?;
      } else if pending.is_empty() {
        println!("Nothing pending");
      } else {
        for p in &pending {
          let error = p.last_error.as_deref().unwrap_or("-");
          println!(
            "#{} {} {} {} (attempts: {}, last error: {error})",
            p.key,
            p.created_at.format("%Y-%m-%d %H:%M:%S"),
            p.kind,
            p.record_id,
            p.attempts
          );
        }
      }
    }
    Command::Sync => {
      let report = client.sync().await?;
      println!("Sync: {report}");
    }
    Command::Precache => {
      let stored = client.interceptor().precache().await?;
      println!("Cached {stored} assets");
    }
    Command::Watch => watch(client, config).await?,
  }

  Ok(())
}

async fn run_review(command: ReviewCommand, client: &RestaurantClient) -> Result<()> {
  match command {
    ReviewCommand::Add {
      restaurant_id,
      name,
      rating,
      comments,
    } => report_write(
      client.add_review(restaurant_id, &name, rating, &comments).await,
      |r| format!("Added review {}", r.id),
    ),
    ReviewCommand::Update {
      id,
      name,
      rating,
      comments,
    } => {
      let mut review = settle(client.fetch_review(id).await?).await;
      if let Some(name) = name {
        review.name = name;
      }
      if let Some(rating) = rating {
        review.rating = rating;
      }
      if let Some(comments) = comments {
        review.comments = comments;
      }
      report_write(client.update_review(&review).await, |r| {
        format!("Updated review {}", r.id)
      })
    }
    ReviewCommand::Delete { id } => report_write(client.delete_review(id).await, |()| {
      format!("Deleted review {id}")
    }),
  }
}

/// Run the sweep on every connectivity or timer signal until interrupted.
async fn watch(client: &RestaurantClient, config: &Config) -> Result<()> {
  let probe_client = client.clone();
  let mut events = EventHandler::new(
    move || {
      let client = probe_client.clone();
      async move { client.interceptor().is_reachable().await }
    },
    config.probe_interval(),
    config.periodic_sync(),
  );

  tracing::info!(api = %config.api_url, "Watching for connectivity");

  loop {
    let event = tokio::select! {
      event = events.next() => event,
      _ = tokio::signal::ctrl_c() => None,
    };

    match event {
      Some(Event::Online | Event::PeriodicSync) => match client.sync().await {
        Ok(report) if report.applied + report.retried + report.rejected > 0 => {
          tracing::info!(%report, "Synced");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Sync failed: {e}"),
      },
      Some(Event::Offline) => tracing::info!("Backend unreachable, writes will be queued"),
      None => break,
    }
  }

  tracing::info!("Stopped watching");
  Ok(())
}

/// Wait for a background refresh so it lands before the process exits,
/// and say so when the data is only the cached copy.
async fn settle<T>(result: CacheResult<T>) -> T {
  if result.source == CacheSource::Cache {
    let refreshed = match result.revalidation {
      Some(revalidation) => revalidation.finished().await,
      None => false,
    };
    if !refreshed {
      if let Some(cached_at) = result.cached_at {
        eprintln!(
          "(offline: showing data cached at {})",
          cached_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
      }
    }
  }
  result.data
}

fn report_write<T>(result: rrsync::Result<T>, describe: impl FnOnce(&T) -> String) -> Result<()> {
  match result {
    Ok(value) => {
      println!("{}", describe(&value));
      Ok(())
    }
    Err(Error::Queued { kind, id }) => {
      println!("Saved offline: {kind} {id} will sync when the backend is reachable");
      Ok(())
    }
    Err(e) => Err(eyre!(e)),
  }
}

fn print_restaurant(r: &Restaurant) {
  let star = if r.is_favorite { "*" } else { " " };
  println!(
    "{star} [{}] {} - {}, {}",
    r.id, r.name, r.cuisine_type, r.neighborhood
  );
}

fn print_json(value: &impl Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
