// LLM-friendly documentation endpoint content.

pub const LLMS_TXT: &str = r#"# Trivia Arena API
> Live multiplayer trivia sessions: admins author and run games, players join by PIN, answer timed questions and, in team battles, claim map territory.

## API Base URL
/api/

## Authentication
Admins: Bearer token (JWT from /api/auth/login).
Players: the token returned by POST /api/play/{pin}/join, passed in the path.

## Key Endpoints
- POST /api/auth/register - Create admin account
- POST /api/auth/login - Get JWT token
- GET /api/auth/me - Get current admin
- GET/POST /api/sessions - List/create sessions (type: team_battle | individual)
- GET/PUT/DELETE /api/sessions/{id} - Get/update/delete session
- GET/PUT /api/sessions/{id}/questions - Read/replace the question set
- PUT /api/sessions/{id}/fields - Configure registration fields
- PUT /api/sessions/{id}/teams - Replace teams (team battles)
- PUT /api/sessions/{id}/map - Resize the territory map (team battles)
- POST /api/sessions/{id}/ready|draft|launch|end - Lifecycle transitions
- GET /api/sessions/{id}/history - Transition history and final results
- GET /api/play/{pin} - Session status for players
- POST /api/play/{pin}/validate - Check registration values without joining
- POST /api/play/{pin}/join - Join; returns a player token
- GET /api/play/{pin}/leaderboard - Current standings
- GET /api/play/{pin}/territories - Map ownership
- GET /api/players/{token} - Player state, achievements and claims available
- GET /api/players/{token}/question - Next question (starts its clock)
- POST /api/players/{token}/answers - Submit {question_id, option_index, client_elapsed_ms}
- POST /api/players/{token}/claims - Claim {territory_id, question_id?}

## Real-time
GET /ws/sessions/{pin} streams JSON events tagged by "type":
status, player_joined, leaderboard, territory_claimed, achievements, completed.

## Session Lifecycle
draft -> ready -> live -> completed. Players join in ready or live; answers
and claims are accepted only while live.

## Errors
JSON body {"error", "code", "field"?}. 409 state conflicts and duplicates,
410 closed answer window, 422 validation, 404 not found, 403 not your
session, 429 rate limited, 503 storage unavailable.
"#;
