use std::net::SocketAddr;

use crate::auth::keep_alive;
use crate::collab::memory_store::examples::*;
use crate::collab::CardOutcome;
use crate::crypto::asymmetric::examples::counting_authority;
use crate::error::Code;
use crate::model::{Person, PostState, StationState, SubStationState, UrnState, UNASSIGNED_BADGE};
use crate::net::SimulatedNetwork;
use crate::protocol::{self, Command, Message};
use crate::terminal::kind;
use crate::testing::{addr, World};

/// Select `voter` at the Station and read `badge` there.
async fn check_in(world: &World, voter: Person, badge: &str) -> CardOutcome {
    world.station().select_voter(voter).unwrap();
    world.station.card_reader().unwrap().swipe(badge).await.unwrap()
}

async fn associate(world: &World, voter: Person, badge: &str) -> SocketAddr {
    match check_in(world, voter, badge).await {
        CardOutcome::Associated(post) => post,
        other => panic!("expected an association, got {other:?}"),
    }
}

#[terminal_test(active)]
async fn everyone_authenticates(world: &World) {
    let trusted = world.urn().trusted_terminals();
    assert_eq!(trusted.len(), 4);
    assert_eq!(world.station().state(), StationState::Active);
    assert_eq!(world.substation().state(), SubStationState::Active);
    assert_eq!(world.substation().station(), Some(addr(STATION)));
    for post in &world.posts {
        assert_eq!(post.terminal().state(), PostState::Active);
        assert_eq!(post.terminal().station(), Some(addr(STATION)));
    }
    for slot in world.station().posts() {
        assert_eq!(slot.state, PostState::Active);
    }
}

#[terminal_test(active)]
async fn voter_casts_ballots(world: &World) {
    let station = world.station();
    let maria = station.search_person("maria", "rossi").await.unwrap().remove(0);
    assert_eq!(maria.id, "V-0001");

    // Check in at the Station.
    let at = associate(world, maria.clone(), "144").await;
    let runner = world.post(at);
    let post = runner.terminal();
    assert_eq!(post.state(), PostState::Associated);
    assert_eq!(post.badge(), "144");
    assert!(station.pending_voter().is_none());

    // Start voting at the Post.
    let outcome = runner.card_reader().unwrap().swipe("144").await.unwrap();
    assert_eq!(outcome, CardOutcome::VotingStarted);
    assert_eq!(post.state(), PostState::InUse);
    assert_eq!(post.ballots().len(), 3);
    assert_eq!(station.post(at).unwrap().state, PostState::InUse);

    post.select(0, "c1").unwrap();
    post.select(1, "m2").unwrap();
    post.select(2, "yes").unwrap();
    post.send_vote().await.unwrap();
    assert_eq!(post.state(), PostState::VoteSent);
    assert_eq!(world.urn().vote_count(), 1);
    assert!(world.store.has_voted(PROCEDURE, &maria.id));
    assert_eq!(station.post(at).unwrap().state, PostState::VoteSent);

    // Returning the badge frees the Post.
    let outcome = world.station.card_reader().unwrap().swipe("144").await.unwrap();
    assert_eq!(outcome, CardOutcome::Released(at));
    assert_eq!(post.state(), PostState::Active);
    assert_eq!(post.badge(), UNASSIGNED_BADGE);
    assert_eq!(station.post(at).unwrap().badge, UNASSIGNED_BADGE);

    // One stored submission, blanks padded out of the tally.
    let stored = world.store.stored_votes();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].station, addr(STATION).ip());
    assert_eq!(stored[0].post, at.ip());
    let tally = world.store.tally(counting_authority()).unwrap();
    assert_eq!(tally.get(&(0, "c1".to_string())), Some(&1));
    assert_eq!(tally.get(&(1, "m2".to_string())), Some(&1));
    assert_eq!(tally.get(&(2, "yes".to_string())), Some(&1));
    assert_eq!(tally.len(), 3);
}

#[terminal_test(active)]
async fn voter_cannot_vote_twice(world: &World) {
    let marco = Person::example2();
    let at = associate(world, marco.clone(), "7").await;
    let runner = world.post(at);
    runner.card_reader().unwrap().swipe("7").await.unwrap();
    runner.terminal().select(1, "m1").unwrap();
    runner.terminal().send_vote().await.unwrap();
    world.station.card_reader().unwrap().swipe("7").await.unwrap();

    // The Urn refuses to issue nonces a second time.
    let at = associate(world, marco, "8").await;
    let runner = world.post(at);
    let outcome = runner.card_reader().unwrap().swipe("8").await.unwrap();
    assert!(matches!(outcome, CardOutcome::Rejected(_)));
    assert_eq!(runner.terminal().state(), PostState::Associated);
    assert_eq!(world.urn().vote_count(), 1);
}

#[terminal_test(active)]
async fn badge_and_post_conflicts(world: &World) {
    let first = associate(world, Person::example(), "1").await;

    // Same badge, another voter.
    let outcome = check_in(world, Person::example2(), "1").await;
    assert_eq!(outcome, CardOutcome::BadgeInUse(first));

    // Same voter, another badge.
    let outcome = check_in(world, Person::example(), "2").await;
    assert!(matches!(outcome, CardOutcome::Rejected(_)));

    let second = associate(world, Person::example2(), "3").await;
    assert_ne!(first, second);

    // Both Posts are taken.
    let outcome = check_in(world, Person::example3(), "4").await;
    assert_eq!(outcome, CardOutcome::NoPostAvailable);

    // No voter selected.
    world.station().clear_voter();
    let outcome = world.station.card_reader().unwrap().swipe("5").await.unwrap();
    assert_eq!(outcome, CardOutcome::NoVoterSelected);
}

/// Read `station_badge` at the Station and `substation_badge` at the SubStation at once.
async fn read_both(world: &World, station_badge: &str, substation_badge: &str) -> (CardOutcome, CardOutcome) {
    let station = world.station.card_reader().unwrap();
    let substation = world.substation.card_reader().unwrap();
    let (here, forwarded) = tokio::join!(station.swipe(station_badge), substation.swipe(substation_badge));
    (here.unwrap(), forwarded.unwrap())
}

fn associated(outcomes: &[&CardOutcome]) -> Vec<SocketAddr> {
    outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            CardOutcome::Associated(post) => Some(*post),
            _ => None,
        })
        .collect()
}

#[terminal_test(active)]
async fn same_badge_read_at_two_desks(world: &World) {
    world.station().select_voter(Person::example()).unwrap();
    world.substation().select_voter(Person::example3()).unwrap();

    let (here, forwarded) = read_both(world, "144", "144").await;
    let posts = associated(&[&here, &forwarded]);
    assert_eq!(posts.len(), 1, "outcomes: {here} / {forwarded}");
    let other = if matches!(here, CardOutcome::Associated(_)) { &forwarded } else { &here };
    assert_eq!(*other, CardOutcome::BadgeInUse(posts[0]));

    let badges = world.station().posts().into_iter().filter(|slot| slot.badge == "144").count();
    assert_eq!(badges, 1);
}

#[terminal_test(active)]
async fn same_voter_read_at_two_desks(world: &World) {
    world.station().select_voter(Person::example()).unwrap();
    world.substation().select_voter(Person::example()).unwrap();

    let (here, forwarded) = read_both(world, "50", "51").await;
    assert_eq!(associated(&[&here, &forwarded]).len(), 1, "outcomes: {here} / {forwarded}");
    let other = if matches!(here, CardOutcome::Associated(_)) { &forwarded } else { &here };
    assert!(matches!(other, CardOutcome::Rejected(_)));

    let seated = world
        .station()
        .posts()
        .into_iter()
        .filter(|slot| slot.voter.as_ref().map(|v| v.id.as_str()) == Some("V-0001"))
        .count();
    assert_eq!(seated, 1);
    assert!(world.station().pending_voter().is_none());
}

#[terminal_test(active)]
async fn last_post_goes_to_one_voter(world: &World) {
    let first = associate(world, Person::example(), "60").await;

    world.station().select_voter(Person::example2()).unwrap();
    world.substation().select_voter(Person::example3()).unwrap();
    let (here, forwarded) = read_both(world, "61", "62").await;

    let posts = associated(&[&here, &forwarded]);
    assert_eq!(posts.len(), 1, "outcomes: {here} / {forwarded}");
    assert_ne!(posts[0], first);
    let other = if matches!(here, CardOutcome::Associated(_)) { &forwarded } else { &here };
    assert_eq!(*other, CardOutcome::NoPostAvailable);
}

#[terminal_test(active)]
async fn wrong_badge_cannot_start_voting(world: &World) {
    let at = associate(world, Person::example3(), "10").await;
    let outcome = world.post(at).card_reader().unwrap().swipe("11").await.unwrap();
    assert!(matches!(outcome, CardOutcome::Rejected(_)));
    assert_eq!(world.post(at).terminal().state(), PostState::Associated);
}

#[terminal_test(active)]
async fn substation_forwards_badges(world: &World) {
    let substation = world.substation();
    let found = substation.search_person("giulia", "").await.unwrap();
    assert_eq!(found, [Person::example3()]);
    substation.select_voter(Person::example3()).unwrap();

    let outcome = world.substation.card_reader().unwrap().swipe("200").await.unwrap();
    let CardOutcome::Associated(at) = outcome else {
        panic!("expected an association, got {outcome:?}");
    };
    assert!(substation.pending_voter().is_none());
    assert_eq!(world.station().post(at).unwrap().badge, "200");
    assert_eq!(world.post(at).terminal().voter(), Some(Person::example3()));
}

#[terminal_test(active)]
async fn station_reset_recovers_a_post(world: &World) {
    let at = associate(world, Person::example(), "30").await;
    world.station().reset_post(at).await.unwrap();
    assert_eq!(world.post(at).terminal().state(), PostState::Active);
    assert_eq!(world.station().post(at).unwrap().state, PostState::Active);
    assert!(world.post(at).terminal().voter().is_none());
}

#[terminal_test(active)]
async fn revoked_post_restarts_and_reauthenticates(world: &World) {
    let post = world.posts[0].terminal();
    let ip = addr(POSTS[0]).ip();
    world.urn().revoke(ip);
    assert!(!world.urn().is_trusted(ip));

    keep_alive(&**post).await;
    assert_eq!(post.state(), PostState::ToRestart);

    keep_alive(&**post).await;
    assert_eq!(post.state(), PostState::Active);
    assert!(world.urn().is_trusted(ip));
}

#[terminal_test(active)]
async fn unreachable_urn_keeps_authentication(world: &World) {
    let urn = addr(URN).ip();
    world.network.partition(urn);
    keep_alive(world.station()).await;
    keep_alive(&**world.posts[1].terminal()).await;
    assert_eq!(world.station().state(), StationState::Active);
    assert_eq!(world.posts[1].terminal().state(), PostState::Active);

    world.network.heal(urn);
    keep_alive(world.station()).await;
    assert_eq!(world.station().state(), StationState::Active);
}

#[terminal_test(active)]
async fn station_shutdown_reaches_posts_and_substation(world: &World) {
    world.station.shut_down().await;
    assert_eq!(world.substation().state(), SubStationState::Waiting);
    for post in &world.posts {
        assert_eq!(post.terminal().state(), PostState::Inactive);
    }
}

#[terminal_test(active)]
async fn urn_shutdown_reaches_everyone(world: &World) {
    world.urn.shut_down().await;
    assert_eq!(world.urn().state(), UrnState::Inactive);
    assert_eq!(world.station().state(), StationState::Inactive);
    assert_eq!(world.substation().state(), SubStationState::Inactive);
    for post in &world.posts {
        assert_eq!(post.terminal().state(), PostState::Inactive);
    }
}

#[terminal_test(active)]
async fn vote_without_nonces_is_refused(world: &World) {
    // Pose as an authenticated Post that never asked for ballots.
    let post = world.network.host(addr(POSTS[0]).ip());
    let vote = Message::new(kind::VOTE);
    let err = protocol::request(&post, addr(URN), Command::SendVote, &vote)
        .await
        .unwrap()
        .verify_ack()
        .unwrap_err();
    assert_eq!(err.code(), Code::NoPendingChallenge);
    assert_eq!(world.urn().vote_count(), 0);
}

#[terminal_test]
async fn strangers_are_refused(network: SimulatedNetwork) {
    let stranger = network.host("10.9.9.9".parse().unwrap());
    let search = Message::new(kind::SEARCH);
    let err = protocol::request(&stranger, addr(URN), Command::SearchPerson, &search)
        .await
        .unwrap()
        .verify_ack()
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthorized);
}

#[terminal_test]
async fn unauthenticated_terminals_cannot_work(world: &World) {
    let err = world.station().search_person("", "").await.unwrap_err();
    assert_eq!(err.code(), Code::WrongState);
    let outcome = world.substation.card_reader().unwrap().swipe("1").await.unwrap();
    assert!(matches!(outcome, CardOutcome::Rejected(_)));
    assert!(world.urn().trusted_terminals().is_empty());
}
