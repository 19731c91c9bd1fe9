use crate::core::{
    domain::{Game, Implementation, Registry, SourceProgram},
    pipeline::bench::{Bench, BenchError},
};

/// Narrows a sweep down. Empty lists select everything.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub games: Vec<String>,
    pub implementations: Vec<String>,
    /// Substrings of source paths.
    pub filters: Vec<String>,
}

impl Selection {
    fn wants_game(&self, name: &str) -> bool {
        self.games.is_empty() || self.games.iter().any(|game| game == name)
    }

    fn wants_implementation(&self, name: &str) -> bool {
        self.implementations.is_empty()
            || self.implementations.iter().any(|implementation| implementation == name)
    }

    fn wants_source(&self, source: &SourceProgram) -> bool {
        let path = source.path.to_string_lossy();
        self.filters.is_empty() || self.filters.iter().any(|filter| path.contains(filter.as_str()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Episode<'a> {
    pub source: &'a SourceProgram,
    pub game: &'a Game,
    pub implementation: &'a Implementation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub episodes: usize,
    pub failed: usize,
}

/// Lists the compatible (source, implementation) pairs in the order they will run:
/// sources in discovery order, implementations by name.
pub fn plan<'a>(
    registry: &'a Registry,
    sources: &'a [SourceProgram],
    selection: &Selection,
) -> Vec<Episode<'a>> {
    let mut episodes = Vec::new();

    for source in sources {
        if !selection.wants_game(&source.game) || !selection.wants_source(source) {
            continue;
        }
        let Some(game) = registry.game(&source.game) else {
            tracing::warn!(
                source = %source.path.display(),
                game = %source.game,
                "Skipping source of unknown game"
            );
            continue;
        };

        episodes.extend(
            registry
                .implementations
                .values()
                .filter(|implementation| selection.wants_implementation(&implementation.name))
                .filter(|implementation| source.supports(implementation))
                .map(|implementation| Episode {
                    source,
                    game,
                    implementation,
                }),
        );
    }

    episodes
}

/// Runs the episodes one after another. Only store failures stop the sweep.
#[tracing::instrument(skip_all, fields(episodes = episodes.len()))]
pub async fn sweep(
    bench: &Bench<'_>,
    episodes: &[Episode<'_>],
) -> Result<SweepSummary, BenchError> {
    let mut summary = SweepSummary::default();

    for episode in episodes {
        summary.episodes += 1;
        match bench
            .run(episode.implementation, episode.game, episode.source)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                summary.failed += 1;
                tracing::error!(
                    implementation = %episode.implementation.name,
                    source = %episode.source.path.display(),
                    "Episode aborted: {}",
                    err
                );
            }
        }
    }

    tracing::info!(
        episodes = summary.episodes,
        failed = summary.failed,
        "Sweep finished"
    );
    Ok(summary)
}
